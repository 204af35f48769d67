//! Orders the pending workloads of every cluster queue
//!
//! Each cluster queue gets its own pending queue ordered by priority,
//! queue order timestamp, and key. Workloads whose local queue has not
//! appeared yet park in an unbound set until the binding arrives.

use chrono::prelude::*;
use std::collections::{BTreeMap, HashMap, VecDeque};

use berth::models::{LocalQueue, WorkloadInfo};
use tracing::{event, Level};

/// The key pending workloads are ordered by
///
/// Higher priority first, then older queue order timestamps, then the
/// namespace/name key so two workloads created in the same second still
/// order deterministically. A workload evicted on PodsReady timeout that
/// has not been readmitted yet goes to the back of the line regardless of
/// priority; its Evicted condition resets on the next admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOrderKey {
    /// Whether this workload was sent to the back by a PodsReady eviction
    pub demoted: bool,
    /// The priority of the workload
    pub priority: i32,
    /// The queue order timestamp of the workload
    pub timestamp: DateTime<Utc>,
    /// The namespace/name key of the workload
    pub key: String,
}

impl QueueOrderKey {
    /// Build the order key for a workload
    ///
    /// # Arguments
    ///
    /// * `info` - The workload to build the key for
    #[must_use]
    pub fn new(info: &WorkloadInfo) -> Self {
        let evicted = info
            .workload
            .condition(berth::models::ConditionType::Evicted)
            .is_some_and(|cond| {
                cond.status && cond.reason == berth::models::EVICTED_BY_PODS_READY_TIMEOUT
            });
        QueueOrderKey {
            demoted: evicted,
            priority: info.workload.spec.priority,
            timestamp: info.workload.queue_order_timestamp(),
            key: info.key(),
        }
    }
}

impl Ord for QueueOrderKey {
    /// Order demoted workloads last, then by priority descending, then by
    /// timestamp and key ascending
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.demoted
            .cmp(&other.demoted)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for QueueOrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The ordered pending workloads of a single cluster queue
#[derive(Debug, Default)]
struct PendingQueue {
    /// The pending workloads ordered by their queue order key
    heap: BTreeMap<QueueOrderKey, WorkloadInfo>,
    /// The order key of each pending workload for removal
    keys: HashMap<String, QueueOrderKey>,
}

impl PendingQueue {
    /// Add a workload to this queue replacing any stale entry
    ///
    /// # Arguments
    ///
    /// * `info` - The workload to add
    fn push(&mut self, info: WorkloadInfo) {
        let key = info.key();
        // drop any stale entry whose order key has since changed
        if let Some(stale) = self.keys.remove(&key) {
            self.heap.remove(&stale);
        }
        let order = QueueOrderKey::new(&info);
        self.keys.insert(key, order.clone());
        self.heap.insert(order, info);
    }

    /// Remove a workload from this queue
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload to remove
    fn remove(&mut self, key: &str) -> Option<WorkloadInfo> {
        let order = self.keys.remove(key)?;
        self.heap.remove(&order)
    }
}

/// The per cluster queue pending sets and the bindings that feed them
#[derive(Default)]
pub struct QueueManager {
    /// The pending queues by cluster queue name
    queues: HashMap<String, PendingQueue>,
    /// The local queue bindings by namespace/name key
    local_queues: HashMap<String, String>,
    /// Workloads whose local queue has not appeared yet
    unbound: HashMap<String, Vec<WorkloadInfo>>,
    /// Which cluster queue each pending workload sits in
    by_workload: HashMap<String, String>,
    /// The latest inadmissibility reason per pending workload
    reasons: HashMap<String, String>,
}

impl QueueManager {
    /// Create a new empty queue manager
    #[must_use]
    pub fn new() -> Self {
        QueueManager::default()
    }

    /// Bind a local queue and flow any parked workloads into its queue
    ///
    /// # Arguments
    ///
    /// * `queue` - The local queue to bind
    pub fn set_local_queue(&mut self, queue: &LocalQueue) {
        let key = queue.key();
        self.local_queues.insert(key.clone(), queue.cluster_queue.clone());
        if let Some(parked) = self.unbound.remove(&key) {
            for info in parked {
                self.push(info);
            }
        }
    }

    /// Remove a local queue binding
    ///
    /// Workloads already routed stay pending; only future pushes park.
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the local queue to remove
    pub fn remove_local_queue(&mut self, key: &str) {
        self.local_queues.remove(key);
    }

    /// Queue a workload for admission
    ///
    /// The workload routes through its local queue binding; if the binding
    /// does not exist yet the workload parks until it appears. The order
    /// key is derived from the workloads conditions, so a workload evicted
    /// on PodsReady timeout lands at the tail by its eviction time.
    ///
    /// # Arguments
    ///
    /// * `info` - The workload to queue
    pub fn push(&mut self, info: WorkloadInfo) {
        let queue_key = info.workload.queue_key();
        let Some(cluster_queue) = self.local_queues.get(&queue_key).cloned() else {
            event!(
                Level::DEBUG,
                workload = info.key(),
                queue = queue_key,
                msg = "Parking workload until its queue appears",
            );
            self.unbound.entry(queue_key).or_default().push(info);
            return;
        };
        let info = info.with_cluster_queue(cluster_queue.clone());
        self.by_workload.insert(info.key(), cluster_queue.clone());
        self.queues.entry(cluster_queue).or_default().push(info);
    }

    /// Remove a workload wherever it is queued or parked
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload to remove
    pub fn remove(&mut self, key: &str) {
        self.reasons.remove(key);
        if let Some(cluster_queue) = self.by_workload.remove(key) {
            if let Some(queue) = self.queues.get_mut(&cluster_queue) {
                queue.remove(key);
            }
            return;
        }
        // the workload may still be parked waiting for its local queue
        for parked in self.unbound.values_mut() {
            parked.retain(|info| info.key() != key);
        }
    }

    /// Record why a workload could not be admitted this cycle
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    /// * `reason` - The human readable reason to record
    pub fn note_inadmissible<T: Into<String>>(&mut self, key: &str, reason: T) {
        self.reasons.insert(key.to_owned(), reason.into());
    }

    /// The latest inadmissibility reason recorded for a workload
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    #[must_use]
    pub fn inadmissible_reason(&self, key: &str) -> Option<&String> {
        self.reasons.get(key)
    }

    /// The number of workloads pending in a cluster queue
    ///
    /// # Arguments
    ///
    /// * `cluster_queue` - The cluster queue to count for
    #[must_use]
    pub fn pending_count(&self, cluster_queue: &str) -> u32 {
        self.queues
            .get(cluster_queue)
            .map(|queue| queue.heap.len() as u32)
            .unwrap_or_default()
    }

    /// Clone the ordered pending workloads of every cluster queue
    ///
    /// The scheduler works over this detached view for one cycle while the
    /// live queues keep absorbing watch events.
    #[must_use]
    pub fn cycle_queues(&self) -> HashMap<String, VecDeque<WorkloadInfo>> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.heap.is_empty())
            .map(|(name, queue)| {
                let ordered = queue.heap.values().cloned().collect();
                (name.clone(), ordered)
            })
            .collect()
    }

    /// The head workload of a cluster queue if it has one
    ///
    /// # Arguments
    ///
    /// * `cluster_queue` - The cluster queue to peek
    #[must_use]
    pub fn head(&self, cluster_queue: &str) -> Option<&WorkloadInfo> {
        self.queues
            .get(cluster_queue)
            .and_then(|queue| queue.heap.values().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth::models::{Condition, ConditionType, ResourceName, EVICTED_BY_PODS_READY_TIMEOUT};
    use berth::test_utilities::{local_queue, WorkloadBuilder};
    use chrono::Duration;

    /// Build a pending workload routed through the unit/lq local queue
    fn pending(name: &str, priority: i32, created: DateTime<Utc>) -> WorkloadInfo {
        let workload = WorkloadBuilder::new("unit", name)
            .queue("lq")
            .priority(priority)
            .created(created)
            .request(ResourceName::Cpu, 1000)
            .build();
        WorkloadInfo::new(workload)
    }

    #[test]
    fn orders_by_priority_then_age_then_key() {
        let mut manager = QueueManager::new();
        manager.set_local_queue(&local_queue("unit", "lq", "cq"));
        let base = Utc::now();
        manager.push(pending("older", 0, base));
        manager.push(pending("newer", 0, base + Duration::seconds(5)));
        manager.push(pending("urgent", 100, base + Duration::seconds(60)));
        // same second as older so the key breaks the tie
        manager.push(pending("aaa", 0, base));
        let order = manager.cycle_queues().remove("cq").unwrap();
        let names = order.iter().map(|info| info.workload.name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["urgent", "aaa", "older", "newer"]);
    }

    #[test]
    fn eviction_requeues_at_the_tail() {
        let mut manager = QueueManager::new();
        manager.set_local_queue(&local_queue("unit", "lq", "cq"));
        let base = Utc::now();
        manager.push(pending("first", 0, base));
        manager.push(pending("second", 0, base + Duration::seconds(1)));
        // evict the head on PodsReady timeout and requeue it
        let mut evicted = pending("first", 0, base);
        evicted.workload.set_condition(Condition::new(
            ConditionType::Evicted,
            true,
            EVICTED_BY_PODS_READY_TIMEOUT,
            "",
        ));
        let evicted = WorkloadInfo::new(evicted.workload);
        manager.push(evicted);
        let order = manager.cycle_queues().remove("cq").unwrap();
        let names = order.iter().map(|info| info.workload.name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["second", "first"]);
        // no duplicate entry for the requeued head
        assert_eq!(manager.pending_count("cq"), 2);
    }

    #[test]
    fn eviction_demotes_past_priority() {
        let mut manager = QueueManager::new();
        manager.set_local_queue(&local_queue("unit", "lq", "cq"));
        let base = Utc::now();
        manager.push(pending("low", 0, base + Duration::seconds(1)));
        // the evicted workload outranks low on priority but goes to the back
        let mut evicted = pending("high", 100, base);
        evicted.workload.set_condition(Condition::new(
            ConditionType::Evicted,
            true,
            EVICTED_BY_PODS_READY_TIMEOUT,
            "",
        ));
        manager.push(WorkloadInfo::new(evicted.workload));
        let order = manager.cycle_queues().remove("cq").unwrap();
        let names = order.iter().map(|info| info.workload.name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["low", "high"]);
    }

    #[test]
    fn workloads_park_until_their_queue_appears() {
        let mut manager = QueueManager::new();
        manager.push(pending("early", 0, Utc::now()));
        assert_eq!(manager.pending_count("cq"), 0);
        // the binding arriving flows the parked workload in
        manager.set_local_queue(&local_queue("unit", "lq", "cq"));
        assert_eq!(manager.pending_count("cq"), 1);
        assert_eq!(manager.head("cq").unwrap().cluster_queue, "cq");
    }

    #[test]
    fn remove_covers_parked_workloads() {
        let mut manager = QueueManager::new();
        manager.push(pending("parked", 0, Utc::now()));
        manager.remove("unit/parked");
        manager.set_local_queue(&local_queue("unit", "lq", "cq"));
        assert_eq!(manager.pending_count("cq"), 0);
    }
}
