//! Queue ordering, FIFO strategies, and preemption end to end

use std::sync::Arc;
use std::time::Duration;

use admitter::Admitter;
use berth::models::{
    ConditionType, PreemptionPolicy, PreemptionRule, QueueingStrategy, ReclaimRule, ResourceName,
    Workload, EVICTED_BY_PREEMPTION,
};
use berth::store::{MemStore, Store};
use berth::test_utilities::{
    local_queue, ClusterQueueBuilder, FlavorQuotasBuilder, ResourceFlavorBuilder, WorkloadBuilder,
};
use chrono::Utc;
use tokio::sync::watch;

/// A running admitter and the store driving it
struct Harness {
    /// The store external collaborators write to
    store: Arc<MemStore>,
    /// Flipping this to true unwinds the admitter
    shutdown: watch::Sender<bool>,
}

impl Harness {
    /// Start an admitter without PodsReady gating
    fn start() -> Self {
        let mut conf = berth::Conf::default();
        conf.berth.admitter.tick_millis = 25;
        conf.berth.admitter.status_flush = 1;
        let store = Arc::new(MemStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(Admitter::new(conf, dyn_store).start(rx));
        Harness { store, shutdown }
    }

    /// Seed the default flavor and a single queue with the given strategy
    ///
    /// # Arguments
    ///
    /// * `strategy` - The queueing strategy to use
    /// * `preemption` - The preemption policy to use
    fn seed_queue(&self, strategy: QueueingStrategy, preemption: PreemptionPolicy) {
        self.store.upsert_flavor(ResourceFlavorBuilder::new("default").build());
        let queue = ClusterQueueBuilder::new("cq")
            .strategy(strategy)
            .preemption(preemption)
            .resource_group(vec![FlavorQuotasBuilder::new("default")
                .resource(ResourceName::Cpu, 5000)
                .build()])
            .build();
        self.store.upsert_cluster_queue(queue);
        self.store.upsert_local_queue(local_queue("batch", "lq", "cq"));
    }

    /// Get a workload from the store
    async fn get(&self, key: &str) -> Workload {
        self.store.get_workload(key).await.unwrap()
    }

    /// Wait until a workload is admitted
    async fn expect_admitted(&self, key: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.get(key).await.is_admitted() {
            assert!(tokio::time::Instant::now() < deadline, "{key} was never admitted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Assert a workload stays unadmitted over several scheduling ticks
    async fn expect_waiting(&self, key: &str) {
        for _ in 0..10 {
            assert!(!self.get(key).await.is_admitted(), "{key} should still be waiting");
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
    }
}

impl Drop for Harness {
    /// Unwind the admitter when a test finishes
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[tokio::test]
async fn strict_fifo_blocks_behind_a_stuck_head() {
    let harness = Harness::start();
    harness.seed_queue(QueueingStrategy::StrictFifo, PreemptionPolicy::default());
    let base = Utc::now();
    // the head can never fit so it blocks the whole queue
    let big = WorkloadBuilder::new("batch", "big")
        .queue("lq")
        .request(ResourceName::Cpu, 6000)
        .created(base)
        .build();
    harness.store.upsert_workload(big);
    let small = WorkloadBuilder::new("batch", "small")
        .queue("lq")
        .request(ResourceName::Cpu, 1000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(small);
    harness.expect_waiting("batch/big").await;
    harness.expect_waiting("batch/small").await;
}

#[tokio::test]
async fn best_effort_fifo_admits_past_a_stuck_head() {
    let harness = Harness::start();
    harness.seed_queue(QueueingStrategy::BestEffortFifo, PreemptionPolicy::default());
    let base = Utc::now();
    let big = WorkloadBuilder::new("batch", "big")
        .queue("lq")
        .request(ResourceName::Cpu, 6000)
        .created(base)
        .build();
    harness.store.upsert_workload(big);
    let small = WorkloadBuilder::new("batch", "small")
        .queue("lq")
        .request(ResourceName::Cpu, 1000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(small);
    // the stuck head does not block the rest of the queue
    harness.expect_admitted("batch/small").await;
    harness.expect_waiting("batch/big").await;
}

#[tokio::test]
async fn same_second_creations_order_by_key() {
    let harness = Harness::start();
    harness.seed_queue(QueueingStrategy::BestEffortFifo, PreemptionPolicy::default());
    let base = Utc::now();
    // only one of these identical workloads can fit
    for name in ["zz-wl", "aa-wl"] {
        let workload = WorkloadBuilder::new("batch", name)
            .queue("lq")
            .request(ResourceName::Cpu, 5000)
            .created(base)
            .build();
        harness.store.upsert_workload(workload);
    }
    // the key breaks the timestamp tie
    harness.expect_admitted("batch/aa-wl").await;
    harness.expect_waiting("batch/zz-wl").await;
}

#[tokio::test]
async fn preemption_evicts_and_admits_the_preemptor() {
    let harness = Harness::start();
    let policy = PreemptionPolicy {
        within_cluster_queue: PreemptionRule::LowerPriority,
        reclaim_within_cohort: ReclaimRule::Never,
    };
    harness.seed_queue(QueueingStrategy::BestEffortFifo, policy);
    let base = Utc::now();
    let low = WorkloadBuilder::new("batch", "low")
        .queue("lq")
        .priority(0)
        .request(ResourceName::Cpu, 4000)
        .created(base)
        .build();
    harness.store.upsert_workload(low);
    harness.expect_admitted("batch/low").await;
    // the high priority workload cannot fit next to the running one
    let high = WorkloadBuilder::new("batch", "high")
        .queue("lq")
        .priority(100)
        .request(ResourceName::Cpu, 3000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(high);
    // the scheduler evicts the low priority victim instead of admitting
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let low = harness.get("batch/low").await;
        if low.is_evicted() {
            let evicted = low.condition(ConditionType::Evicted).unwrap();
            assert_eq!(evicted.reason, EVICTED_BY_PREEMPTION);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "low was never preempted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // the ack frees the quota and the preemptor enters
    harness.store.ack_eviction("batch/low").unwrap();
    harness.expect_admitted("batch/high").await;
    // the victim no longer fits next to the preemptor
    harness.expect_waiting("batch/low").await;
}

#[tokio::test]
async fn status_counters_mirror_the_queue() {
    let harness = Harness::start();
    harness.seed_queue(QueueingStrategy::BestEffortFifo, PreemptionPolicy::default());
    let base = Utc::now();
    let running = WorkloadBuilder::new("batch", "running")
        .queue("lq")
        .request(ResourceName::Cpu, 4000)
        .created(base)
        .build();
    harness.store.upsert_workload(running);
    let pending = WorkloadBuilder::new("batch", "pending")
        .queue("lq")
        .request(ResourceName::Cpu, 4000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(pending);
    harness.expect_admitted("batch/running").await;
    // wait out a status flush then check the mirrored counters
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = harness.store.queue_status("cq");
    assert_eq!(status.admitted_workloads, 1);
    assert_eq!(status.pending_workloads, 1);
    assert_eq!(status.flavors_usage[0].name, "default");
    assert_eq!(status.flavors_usage[0].resources[0].total, 4000);
}
