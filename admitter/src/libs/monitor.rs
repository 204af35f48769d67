//! Evicts admitted workloads whose pods never reach readiness
//!
//! The monitor arms a deadline for every admission and fires an eviction
//! through the store when the deadline passes without PodsReady. It never
//! touches the cache; the cache reacts to the resulting watch events, so
//! the eviction timer can never deadlock against the scheduling lock.

use chrono::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use berth::models::EVICTED_BY_PODS_READY_TIMEOUT;
use berth::store::Store;
use berth::Error;
use tokio::sync::{mpsc, watch};
use tracing::{event, instrument, Level};

/// The messages the ingest task feeds the monitor
#[derive(Debug, Clone)]
pub enum MonitorMsg {
    /// A workload was admitted and its readiness clock started
    Admitted {
        /// The namespace/name key of the workload
        key: String,
        /// When the Admitted condition last flipped true
        admitted_at: DateTime<Utc>,
    },
    /// A workload no longer needs its readiness clock
    Disarm {
        /// The namespace/name key of the workload
        key: String,
    },
}

/// Tracks admitted workloads and evicts the ones that time out
pub struct Monitor {
    /// How long an admitted workload may take to reach readiness
    timeout: chrono::Duration,
    /// The store evictions are issued through
    store: Arc<dyn Store>,
    /// The channel deadline changes arrive on
    rx: mpsc::UnboundedReceiver<MonitorMsg>,
    /// The armed deadlines in firing order
    deadlines: BTreeMap<DateTime<Utc>, Vec<String>>,
    /// The deadline armed for each workload
    armed: HashMap<String, DateTime<Utc>>,
}

impl Monitor {
    /// Create a new PodsReady monitor
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long an admitted workload may take to reach readiness
    /// * `store` - The store to issue evictions through
    /// * `rx` - The channel deadline changes arrive on
    pub fn new(
        timeout: chrono::Duration,
        store: Arc<dyn Store>,
        rx: mpsc::UnboundedReceiver<MonitorMsg>,
    ) -> Self {
        Monitor {
            timeout,
            store,
            rx,
            deadlines: BTreeMap::default(),
            armed: HashMap::default(),
        }
    }

    /// Watch deadlines and fire evictions until told to shut down
    ///
    /// # Arguments
    ///
    /// * `shutdown` - The signal that unwinds this loop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        loop {
            // sleep until the earliest deadline or just idle for a while
            let wait = match self.deadlines.keys().next() {
                Some(at) => (*at - Utc::now()).to_std().unwrap_or_default(),
                None => std::time::Duration::from_secs(3600),
            };
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                () = tokio::time::sleep(wait) => self.fire().await,
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

    /// Apply a deadline change from the ingest task
    ///
    /// # Arguments
    ///
    /// * `msg` - The change to apply
    fn handle(&mut self, msg: MonitorMsg) {
        match msg {
            MonitorMsg::Admitted { key, admitted_at } => {
                let deadline = admitted_at + self.timeout;
                // a readmission rearms with the fresh admission time
                self.disarm(&key);
                self.armed.insert(key.clone(), deadline);
                self.deadlines.entry(deadline).or_default().push(key);
            }
            MonitorMsg::Disarm { key } => self.disarm(&key),
        }
    }

    /// Drop the armed deadline for a workload if one exists
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    fn disarm(&mut self, key: &str) {
        if let Some(deadline) = self.armed.remove(key) {
            if let Some(keys) = self.deadlines.get_mut(&deadline) {
                keys.retain(|armed| armed != key);
                if keys.is_empty() {
                    self.deadlines.remove(&deadline);
                }
            }
        }
    }

    /// Evict every workload whose deadline has passed
    #[instrument(name = "Monitor::fire", skip_all)]
    async fn fire(&mut self) {
        let now = Utc::now();
        // pull out every deadline that has come due
        let later = self.deadlines.split_off(&now);
        let due = std::mem::replace(&mut self.deadlines, later);
        for key in due.into_values().flatten() {
            self.armed.remove(&key);
            self.evict(&key, now).await;
        }
    }

    /// Evict a single timed out workload through the store
    ///
    /// The workload is re-checked against the store first since the watch
    /// event that would have disarmed it may still be in flight.
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    /// * `now` - When this deadline fired
    async fn evict(&mut self, key: &str, now: DateTime<Utc>) {
        let workload = match self.store.get_workload(key).await {
            Ok(workload) => workload,
            Err(_) => return,
        };
        if !workload.is_admitted() || workload.pods_ready() || workload.is_evicted() {
            return;
        }
        let message = format!("Exceeded the PodsReady timeout {key}");
        let outcome = self
            .store
            .evict(
                key,
                workload.resource_version,
                EVICTED_BY_PODS_READY_TIMEOUT,
                &message,
            )
            .await;
        match outcome {
            Ok(_) => event!(Level::INFO, workload = key, msg = "Evicted on PodsReady timeout"),
            Err(error) if error.is_transient() => {
                // someone raced us so try again shortly
                event!(
                    Level::WARN,
                    workload = key,
                    error = error.msg(),
                    msg = "Eviction conflicted, retrying",
                );
                let retry = now + chrono::Duration::seconds(1);
                self.armed.insert(key.to_owned(), retry);
                self.deadlines.entry(retry).or_default().push(key.to_owned());
            }
            Err(error) => event!(
                Level::ERROR,
                workload = key,
                error = error.msg(),
                msg = "Failed to evict timed out workload",
            ),
        }
    }
}
