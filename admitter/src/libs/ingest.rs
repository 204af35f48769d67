//! Keeps the cache and queues in sync with the store watch stream
//!
//! Ingest is the only writer that applies watch events to the shared
//! state. Each event is applied under the scheduling lock and then the
//! scheduler is woken so reactions land within one tick.

use std::sync::{Arc, Mutex};

use berth::models::{ConditionType, Workload, WorkloadInfo};
use berth::store::{Store, StoreEvent, WatchEvent};
use berth::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{event, Level};

use super::monitor::MonitorMsg;
use super::scheduler::State;

/// Apply watch events to the shared state until told to shut down
///
/// # Arguments
///
/// * `store` - The store to subscribe to
/// * `state` - The cache and queues shared with the scheduler
/// * `monitor` - The channel to feed the PodsReady monitor
/// * `wake` - The notifier that wakes the scheduler
/// * `shutdown` - The signal that unwinds this loop
pub async fn run(
    store: Arc<dyn Store>,
    state: Arc<Mutex<State>>,
    monitor: mpsc::UnboundedSender<MonitorMsg>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut rx = store.subscribe().await;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(received) => {
                    apply(&state, &monitor, received);
                    wake.notify_one();
                }
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

/// Apply a single watch event under the scheduling lock
///
/// # Arguments
///
/// * `state` - The cache and queues shared with the scheduler
/// * `monitor` - The channel to feed the PodsReady monitor
/// * `received` - The event to apply
fn apply(
    state: &Arc<Mutex<State>>,
    monitor: &mpsc::UnboundedSender<MonitorMsg>,
    received: StoreEvent,
) {
    // a poisoned scheduling lock is unrecoverable
    let mut state = state.lock().expect("scheduling lock poisoned");
    match received {
        StoreEvent::Flavor(WatchEvent::Added(flavor) | WatchEvent::Modified(flavor)) => {
            state.cache.add_or_update_flavor(flavor);
        }
        StoreEvent::Flavor(WatchEvent::Deleted(flavor)) => {
            state.cache.delete_flavor(&flavor.name);
        }
        StoreEvent::ClusterQueue(WatchEvent::Added(queue) | WatchEvent::Modified(queue)) => {
            state.cache.add_or_update_cluster_queue(queue);
        }
        StoreEvent::ClusterQueue(WatchEvent::Deleted(queue)) => {
            state.cache.delete_cluster_queue(&queue.name);
        }
        StoreEvent::LocalQueue(WatchEvent::Added(queue) | WatchEvent::Modified(queue)) => {
            state.cache.add_or_update_local_queue(&queue);
            state.queues.set_local_queue(&queue);
        }
        StoreEvent::LocalQueue(WatchEvent::Deleted(queue)) => {
            state.cache.delete_local_queue(&queue.key());
            state.queues.remove_local_queue(&queue.key());
        }
        StoreEvent::Workload(WatchEvent::Added(workload) | WatchEvent::Modified(workload)) => {
            route(&mut state, monitor, workload);
        }
        StoreEvent::Workload(WatchEvent::Deleted(workload)) => {
            let key = workload.key();
            state.cache.delete_workload(&key);
            state.queues.remove(&key);
            let _ = monitor.send(MonitorMsg::Disarm { key });
        }
    }
}

/// Route a created or updated workload into the cache or the queues
///
/// # Arguments
///
/// * `state` - The locked cache and queues
/// * `monitor` - The channel to feed the PodsReady monitor
/// * `workload` - The workload to route
fn route(
    state: &mut State,
    monitor: &mpsc::UnboundedSender<MonitorMsg>,
    workload: Workload,
) {
    let key = workload.key();
    // finished workloads release their usage and never requeue
    if workload.is_finished() {
        event!(Level::INFO, workload = key, msg = "Workload finished");
        state.cache.delete_workload(&key);
        state.queues.remove(&key);
        let _ = monitor.send(MonitorMsg::Disarm { key });
        return;
    }
    if workload.is_admitted() && workload.status.admission.is_some() {
        // the monitor only times workloads still waiting on readiness
        if workload.pods_ready() || workload.is_evicted() {
            let _ = monitor.send(MonitorMsg::Disarm { key: key.clone() });
        } else if let Some(cond) = workload.condition(ConditionType::Admitted) {
            let _ = monitor.send(MonitorMsg::Admitted {
                key: key.clone(),
                admitted_at: cond.last_transition,
            });
        }
        let info = WorkloadInfo::new(workload);
        state.queues.remove(&key);
        state.cache.add_workload(info);
    } else {
        // unadmitted covers fresh workloads and acknowledged evictions;
        // the order key comes from the workloads conditions so a PodsReady
        // eviction lands at the tail
        state.cache.delete_workload(&key);
        state.queues.push(WorkloadInfo::new(workload));
        let _ = monitor.send(MonitorMsg::Disarm { key });
    }
}
