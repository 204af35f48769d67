//! Scheduling behavior when admission waits on pod readiness

use std::sync::Arc;
use std::time::Duration;

use admitter::Admitter;
use berth::models::{ConditionType, ResourceName, Workload};
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
    /// Start an admitter with a fast tick against a fresh store
    ///
    /// # Arguments
    ///
    /// * `pods_ready_timeout` - The PodsReady timeout in seconds if gating is on
    fn start(pods_ready_timeout: Option<u64>) -> Self {
        let mut conf = berth::Conf::default();
        conf.berth.admitter.tick_millis = 25;
        conf.berth.admitter.pods_ready_timeout = pods_ready_timeout;
        conf.berth.admitter.status_flush = 1;
        let store = Arc::new(MemStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(Admitter::new(conf, dyn_store).start(rx));
        Harness { store, shutdown }
    }

    /// Seed the default flavor plus the prod/dev queues of the scenarios
    fn seed_two_queues(&self) {
        self.store.upsert_flavor(ResourceFlavorBuilder::new("default").build());
        for name in ["prod", "dev"] {
            let queue = ClusterQueueBuilder::new(format!("{name}-cq"))
                .cohort("all")
                .resource_group(vec![FlavorQuotasBuilder::new("default")
                    .resource(ResourceName::Cpu, 5000)
                    .build()])
                .build();
            self.store.upsert_cluster_queue(queue);
            self.store
                .upsert_local_queue(local_queue("podsready", format!("{name}-queue"), format!("{name}-cq")));
        }
    }

    /// Get a workload from the store
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    async fn get(&self, key: &str) -> Workload {
        self.store.get_workload(key).await.unwrap()
    }

    /// Wait until a workload is admitted into a specific queue
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    /// * `queue` - The queue it should be admitted into
    async fn expect_admitted(&self, key: &str, queue: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let workload = self.get(key).await;
            if workload.is_admitted() {
                let admitted_into = workload.status.admission.as_ref().unwrap();
                assert_eq!(admitted_into.cluster_queue, queue, "{key} admitted into wrong queue");
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{key} was never admitted into {queue}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Assert a workload stays unadmitted over several scheduling ticks
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    async fn expect_waiting(&self, key: &str) {
        for _ in 0..10 {
            assert!(!self.get(key).await.is_admitted(), "{key} should still be waiting");
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
    }

    /// Wait until a workload has Evicted=True
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload
    async fn expect_evicted(&self, key: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.get(key).await.is_evicted() {
            assert!(tokio::time::Instant::now() < deadline, "{key} was never evicted");
            tokio::time::sleep(Duration::from_millis(20)).await;
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
async fn eviction_unblocks_other_queues() {
    let harness = Harness::start(Some(2));
    harness.seed_two_queues();
    let base = Utc::now();
    let prod_wl = WorkloadBuilder::new("podsready", "prod-wl")
        .queue("prod-queue")
        .request(ResourceName::Cpu, 2000)
        .created(base)
        .build();
    harness.store.upsert_workload(prod_wl);
    let dev_wl = WorkloadBuilder::new("podsready", "dev-wl")
        .queue("dev-queue")
        .request(ResourceName::Cpu, 2000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(dev_wl);
    // the first workload admits while the second waits on the gate even
    // though its own queue has room
    harness.expect_admitted("podsready/prod-wl", "prod-cq").await;
    harness.expect_waiting("podsready/dev-wl").await;
    // the timeout evicts the stalled workload and the ack frees its usage
    harness.expect_evicted("podsready/prod-wl").await;
    harness.store.ack_eviction("podsready/prod-wl").unwrap();
    harness.expect_admitted("podsready/dev-wl", "dev-cq").await;
    // the evicted workload released everything it held
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let status = harness.store.queue_status("prod-cq");
    assert_eq!(status.admitted_workloads, 0);
    assert_eq!(status.flavors_usage[0].resources[0].total, 0);
}

#[tokio::test]
async fn pods_ready_unblocks_other_queues() {
    let harness = Harness::start(Some(60));
    harness.seed_two_queues();
    let base = Utc::now();
    let prod_wl = WorkloadBuilder::new("podsready", "prod-wl")
        .queue("prod-queue")
        .request(ResourceName::Cpu, 2000)
        .created(base)
        .build();
    harness.store.upsert_workload(prod_wl);
    let dev_wl = WorkloadBuilder::new("podsready", "dev-wl")
        .queue("dev-queue")
        .request(ResourceName::Cpu, 2000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(dev_wl);
    harness.expect_admitted("podsready/prod-wl", "prod-cq").await;
    harness.expect_waiting("podsready/dev-wl").await;
    // readiness on the first workload lifts the gate
    harness.store.set_pods_ready("podsready/prod-wl").unwrap();
    harness.expect_admitted("podsready/dev-wl", "dev-cq").await;
}

#[tokio::test]
async fn delete_unblocks_other_queues() {
    let harness = Harness::start(Some(60));
    harness.seed_two_queues();
    let base = Utc::now();
    let prod_wl = WorkloadBuilder::new("podsready", "prod-wl")
        .queue("prod-queue")
        .request(ResourceName::Cpu, 2000)
        .created(base)
        .build();
    harness.store.upsert_workload(prod_wl);
    let dev_wl = WorkloadBuilder::new("podsready", "dev-wl")
        .queue("dev-queue")
        .request(ResourceName::Cpu, 2000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(dev_wl);
    harness.expect_admitted("podsready/prod-wl", "prod-cq").await;
    harness.expect_waiting("podsready/dev-wl").await;
    // an external delete frees the usage without any eviction dance
    harness.store.delete_workload("podsready/prod-wl").unwrap();
    harness.expect_admitted("podsready/dev-wl", "dev-cq").await;
}

#[tokio::test]
async fn gate_blocks_the_second_head_in_one_cycle() {
    let harness = Harness::start(Some(60));
    harness.seed_two_queues();
    let base = Utc::now();
    // neither workload fits until the third queue joins the cohort
    let prod_wl = WorkloadBuilder::new("podsready", "prod-wl")
        .queue("prod-queue")
        .request(ResourceName::Cpu, 11_000)
        .created(base)
        .build();
    harness.store.upsert_workload(prod_wl);
    let dev_wl = WorkloadBuilder::new("podsready", "dev-wl")
        .queue("dev-queue")
        .request(ResourceName::Cpu, 11_000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(dev_wl);
    harness.expect_waiting("podsready/prod-wl").await;
    // the new queue brings enough cohort capacity for both at once
    let test_cq = ClusterQueueBuilder::new("test-cq")
        .cohort("all")
        .resource_group(vec![FlavorQuotasBuilder::new("default")
            .resource(ResourceName::Cpu, 25_000)
            .build()])
        .build();
    harness.store.upsert_cluster_queue(test_cq);
    // the earlier timestamp wins and the gate holds the other back
    harness.expect_admitted("podsready/prod-wl", "prod-cq").await;
    harness.expect_waiting("podsready/dev-wl").await;
}

#[tokio::test]
async fn timed_out_workload_requeues_behind_lower_priority() {
    let harness = Harness::start(Some(2));
    harness.seed_two_queues();
    let base = Utc::now();
    let high = WorkloadBuilder::new("podsready", "prod1")
        .queue("prod-queue")
        .priority(100)
        .request(ResourceName::Cpu, 2000)
        .created(base)
        .build();
    harness.store.upsert_workload(high);
    let low = WorkloadBuilder::new("podsready", "prod2")
        .queue("prod-queue")
        .priority(0)
        .request(ResourceName::Cpu, 2000)
        .created(base + chrono::Duration::seconds(1))
        .build();
    harness.store.upsert_workload(low);
    harness.expect_admitted("podsready/prod1", "prod-cq").await;
    harness.expect_waiting("podsready/prod2").await;
    // the eviction was not raised before the timeout passed
    let admitted_at = harness
        .get("podsready/prod1")
        .await
        .condition(ConditionType::Admitted)
        .unwrap()
        .last_transition;
    harness.expect_evicted("podsready/prod1").await;
    let evicted_at = harness
        .get("podsready/prod1")
        .await
        .condition(ConditionType::Evicted)
        .unwrap()
        .last_transition;
    assert!(evicted_at - admitted_at >= chrono::Duration::milliseconds(1900));
    harness.store.ack_eviction("podsready/prod1").unwrap();
    // the lower priority workload wins because the evicted one went to
    // the back of the line
    harness.expect_admitted("podsready/prod2", "prod-cq").await;
    harness.expect_waiting("podsready/prod1").await;
}

#[tokio::test]
async fn evicted_workloads_cycle_through_the_queue() {
    let harness = Harness::start(Some(2));
    harness.seed_two_queues();
    let base = Utc::now();
    // each workload fills the whole queue so only one runs at a time
    for (index, name) in ["prod1", "prod2", "prod3"].iter().enumerate() {
        let workload = WorkloadBuilder::new("podsready", *name)
            .queue("eviction-lq")
            .request(ResourceName::Cpu, 5000)
            .created(base + chrono::Duration::seconds(index as i64))
            .build();
        harness.store.upsert_workload(workload);
    }
    // admission starts once the local queue appears
    harness
        .store
        .upsert_local_queue(local_queue("podsready", "eviction-lq", "prod-cq"));
    harness.expect_admitted("podsready/prod1", "prod-cq").await;
    // the timeout pushes the first workload to the tail
    harness.expect_evicted("podsready/prod1").await;
    harness.store.ack_eviction("podsready/prod1").unwrap();
    harness.expect_admitted("podsready/prod2", "prod-cq").await;
    // finishing the running workload admits the next in line
    harness.store.finish("podsready/prod2").unwrap();
    harness.expect_admitted("podsready/prod3", "prod-cq").await;
    harness.store.finish("podsready/prod3").unwrap();
    // the evicted workload finally comes back around
    harness.expect_admitted("podsready/prod1", "prod-cq").await;
}
