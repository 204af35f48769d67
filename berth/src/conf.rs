//! The shared config for Berth

use std::path::Path;

/// Helps serde default the scheduler tick to 250ms
fn default_tick() -> u64 {
    250
}

/// Helps serde default the status flush interval to 5 seconds
fn default_status_flush() -> u64 {
    5
}

/// Helps serde default the usage log interval to 60 seconds
fn default_usage_log() -> u64 {
    60
}

/// Helps serde default the standalone eviction ack delay to 0ms
fn default_ack_delay() -> u64 {
    0
}

/// The log levels Berth services can log at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Do not log
    Off,
    /// Log errors only
    Error,
    /// Log warnings and above
    Warn,
    /// Log info and above
    #[default]
    Info,
    /// Log debug and above
    Debug,
    /// Log everything
    Trace,
}

/// The tracing settings for a Berth service
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Tracing {
    /// The level to log at
    #[serde(default)]
    pub level: LogLevel,
}

/// The settings for the admission scheduler
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Admitter {
    /// How often to run a scheduling cycle in milliseconds
    #[serde(default = "default_tick")]
    pub tick_millis: u64,
    /// How long an admitted workload may take to reach pod readiness in
    /// seconds where None disables PodsReady gating entirely
    #[serde(default)]
    pub pods_ready_timeout: Option<u64>,
    /// How often to mirror queue status counters to the store in seconds
    #[serde(default = "default_status_flush")]
    pub status_flush: u64,
    /// How often to log per queue usage in seconds
    #[serde(default = "default_usage_log")]
    pub usage_log: u64,
    /// How long the standalone shim waits before acknowledging an eviction
    /// in milliseconds
    #[serde(default = "default_ack_delay")]
    pub ack_delay_millis: u64,
}

impl Default for Admitter {
    /// Create a default admitter config
    fn default() -> Self {
        Admitter {
            tick_millis: default_tick(),
            pods_ready_timeout: None,
            status_flush: default_status_flush(),
            usage_log: default_usage_log(),
            ack_delay_millis: default_ack_delay(),
        }
    }
}

/// The Berth settings shared by all services
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Berth {
    /// The settings for the admission scheduler
    #[serde(default)]
    pub admitter: Admitter,
    /// The tracing settings for this service
    #[serde(default)]
    pub tracing: Tracing,
}

/// The config for all Berth services
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Conf {
    /// The Berth settings
    #[serde(default)]
    pub berth: Berth,
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("berth")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// The PodsReady timeout as a chrono duration if gating is enabled
    #[must_use]
    pub fn pods_ready_timeout(&self) -> Option<chrono::Duration> {
        self.berth
            .admitter
            .pods_ready_timeout
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let conf: Conf = serde_yaml::from_str("berth: {}").unwrap();
        assert_eq!(conf.berth.admitter.tick_millis, 250);
        assert!(conf.pods_ready_timeout().is_none());
        assert_eq!(conf.berth.tracing.level, LogLevel::Info);
    }

    #[test]
    fn pods_ready_timeout_parses_as_seconds() {
        let raw = "berth:\n  admitter:\n    pods_ready_timeout: 60\n";
        let conf: Conf = serde_yaml::from_str(raw).unwrap();
        assert_eq!(conf.pods_ready_timeout(), Some(chrono::Duration::seconds(60)));
    }
}
