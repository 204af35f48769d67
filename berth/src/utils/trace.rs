//! Sets up tracing for Berth services on stdout

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::conf::{LogLevel, Tracing};

/// Cast our log level to a tracing level filter
fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

/// Setup the tracing subscriber for a Berth service
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing settings to apply
pub fn setup(name: &str, conf: &Tracing) {
    // build a stdout layer filtered to our configured level
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(level_filter(conf.level));
    // install it as the global subscriber
    tracing_subscriber::registry().with(layer).init();
    tracing::event!(tracing::Level::INFO, service = name, msg = "Tracing initialized");
}
