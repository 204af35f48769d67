//! Wires the scheduler, ingest, and monitor tasks into one service

use std::sync::{Arc, Mutex};

use berth::store::{MemStore, Store, StoreEvent, WatchEvent};
use berth::{Conf, Error};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{event, Level};

use super::monitor::Monitor;
use super::scheduler::{Scheduler, State};
use super::{ingest, queues::QueueManager, Cache};

/// The Berth admission scheduler service
pub struct Admitter {
    /// The Berth config
    conf: Conf,
    /// The store this admitter schedules against
    store: Arc<dyn Store>,
    /// The cache and queues shared by all tasks
    state: Arc<Mutex<State>>,
}

impl Admitter {
    /// Create a new admitter
    ///
    /// # Arguments
    ///
    /// * `conf` - The Berth config
    /// * `store` - The store to schedule against
    pub fn new(conf: Conf, store: Arc<dyn Store>) -> Self {
        let state = State {
            cache: Cache::new(),
            queues: QueueManager::new(),
        };
        Admitter {
            conf,
            store,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Start admitting workloads until told to shut down
    ///
    /// # Arguments
    ///
    /// * `shutdown` - The signal that unwinds all tasks
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let wake = Arc::new(Notify::new());
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        // keep the cache and queues in sync with the store
        let ingest = tokio::spawn(ingest::run(
            self.store.clone(),
            self.state.clone(),
            monitor_tx,
            wake.clone(),
            shutdown.clone(),
        ));
        // only time admissions when PodsReady gating is configured
        let monitor = self.conf.pods_ready_timeout().map(|timeout| {
            let monitor = Monitor::new(timeout, self.store.clone(), monitor_rx);
            tokio::spawn(monitor.run(shutdown.clone()))
        });
        // run scheduling cycles on this task until shutdown
        let scheduler = Scheduler::new(self.conf, self.store, self.state, wake);
        scheduler.run(shutdown).await?;
        ingest.await??;
        if let Some(handle) = monitor {
            handle.await??;
        }
        Ok(())
    }
}

/// Acknowledge evictions the way an external job controller would
///
/// Standalone mode has no orchestrator, so this shim observes evictions
/// and clears their admissions after the configured delay.
///
/// # Arguments
///
/// * `store` - The in-memory store to watch and acknowledge against
/// * `delay_millis` - How long to wait before acknowledging an eviction
/// * `shutdown` - The signal that unwinds this loop
pub async fn run_shim(
    store: Arc<MemStore>,
    delay_millis: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut rx = store.subscribe().await;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(StoreEvent::Workload(
                    WatchEvent::Added(workload) | WatchEvent::Modified(workload),
                )) => {
                    // only evictions that still hold an admission need an ack
                    if workload.is_evicted() && workload.status.admission.is_some() {
                        if delay_millis > 0 {
                            tokio::time::sleep(std::time::Duration::from_millis(delay_millis)).await;
                        }
                        let key = workload.key();
                        match store.ack_eviction(&key) {
                            Ok(_) => {
                                event!(Level::INFO, workload = key, msg = "Acknowledged eviction");
                            }
                            // someone else may have already acknowledged it
                            Err(error) => {
                                event!(Level::DEBUG, workload = key, error = error.msg());
                            }
                        }
                    }
                }
                Some(_) => (),
                None => break,
            },
            changed = shutdown.changed() => {
                // a dropped sender also counts as a shutdown
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}
