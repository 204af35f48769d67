use clap::Parser;

/// The command line args to pass to the admitter
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "berth.yml")]
    pub config: String,
    /// Override the configured scheduling tick in milliseconds
    #[clap(short, long)]
    pub tick_millis: Option<u64>,
    /// Run against the in-memory store with a shim acking evictions
    #[clap(long, default_value_t)]
    pub standalone: bool,
    /// The path to a YAML file of objects to seed the in-memory store with
    #[clap(long)]
    pub seed: Option<String>,
}
