use clap::Parser;
use serde_derive::Deserialize;
use std::sync::Arc;

use berth::models::{ClusterQueue, LocalQueue, ResourceFlavor, Workload};
use berth::store::MemStore;
use berth::Error;

mod args;
mod libs;

use libs::{admitter, Admitter};

/// The objects a seed file can preload the in-memory store with
#[derive(Deserialize, Debug, Default)]
struct Seed {
    /// The resource flavors to preload
    #[serde(default)]
    flavors: Vec<ResourceFlavor>,
    /// The cluster queues to preload
    #[serde(default)]
    cluster_queues: Vec<ClusterQueue>,
    /// The local queues to preload
    #[serde(default)]
    local_queues: Vec<LocalQueue>,
    /// The workloads to preload
    #[serde(default)]
    workloads: Vec<Workload>,
}

/// Preload the in-memory store from a YAML seed file
///
/// # Arguments
///
/// * `store` - The store to preload
/// * `path` - The path to the seed file
fn seed_store(store: &MemStore, path: &str) -> Result<(), Error> {
    let raw = std::fs::read_to_string(path)?;
    let seed: Seed = serde_yaml::from_str(&raw)?;
    for flavor in seed.flavors {
        store.upsert_flavor(flavor);
    }
    for queue in seed.cluster_queues {
        store.upsert_cluster_queue(queue);
    }
    for queue in seed.local_queues {
        store.upsert_local_queue(queue);
    }
    for workload in seed.workloads {
        store.upsert_workload(workload);
    }
    Ok(())
}

/// The Berth admission scheduler
#[tokio::main]
async fn main() {
    // get command line args
    let args = args::Args::parse();
    // try to load a config file
    let mut conf = berth::Conf::new(&args.config).expect("Failed to load config");
    // let the command line override the configured tick
    if let Some(tick) = args.tick_millis {
        conf.berth.admitter.tick_millis = tick;
    }
    // setup our tracer
    berth::utils::trace::setup("BerthAdmitter", &conf.berth.tracing);
    // the only store this binary can build itself is the in-memory one
    if !args.standalone {
        eprintln!("No external store is configured; run with --standalone");
        std::process::exit(1);
    }
    let store = Arc::new(MemStore::new());
    // preload any seed objects
    if let Some(path) = &args.seed {
        seed_store(&store, path).expect("Failed to seed the store");
    }
    // a ctrl-c flips the shutdown signal for every task
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });
    // the shim stands in for the external job controller
    tokio::spawn(admitter::run_shim(
        store.clone(),
        conf.berth.admitter.ack_delay_millis,
        shutdown_rx.clone(),
    ));
    // setup the admitter
    let admitter = Admitter::new(conf, store);
    // start admitting workloads
    admitter.start(shutdown_rx).await.expect("Admitter crashed");
}
