//! The admission cycle that drains queue heads against a cache snapshot
//!
//! Each cycle snapshots the cache, walks the pending heads of every queue
//! in one global order, computes flavor assignments against the snapshot
//! plus the usage staged by earlier heads, and finally commits admissions
//! and planned evictions through the store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use berth::models::{
    Admission, LabelSelector, QueueingStrategy, WorkloadInfo, EVICTED_BY_PREEMPTION,
    NAMESPACE_NAME_LABEL,
};
use berth::store::Store;
use berth::{Conf, Error};
use tokio::sync::Notify;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

use super::assigner::{self, AssignmentMode};
use super::cache::{Cache, Snapshot};
use super::preempt;
use super::queues::{QueueManager, QueueOrderKey};
use super::Tasks;

/// The cache and queue manager guarded by the single scheduling lock
#[derive(Default)]
pub struct State {
    /// The authoritative projection of external state
    pub cache: Cache,
    /// The ordered pending workloads of every cluster queue
    pub queues: QueueManager,
}

/// Check a workloads namespace against a queues selector
///
/// Namespaces always carry their own name as an implicit label, which is
/// the only namespace label available to the core.
///
/// # Arguments
///
/// * `selector` - The queues namespace selector if it has one
/// * `info` - The workload being admitted
fn namespace_allowed(selector: Option<&LabelSelector>, info: &WorkloadInfo) -> Result<bool, Error> {
    let Some(selector) = selector else {
        return Ok(true);
    };
    let labels = [(
        NAMESPACE_NAME_LABEL.to_owned(),
        info.workload.namespace.clone(),
    )]
    .into_iter()
    .collect();
    selector.matches(&labels)
}

/// An admission staged during a cycle and awaiting commit
struct StagedAdmission {
    /// The workload being admitted
    info: WorkloadInfo,
    /// The admission to persist
    admission: Admission,
}

/// The admission scheduler loop
pub struct Scheduler {
    /// The Berth config
    conf: Conf,
    /// The store decisions are committed through
    store: Arc<dyn Store>,
    /// The cache and queues shared with the ingest task
    state: Arc<Mutex<State>>,
    /// Wakes the loop when the ingest task applies a change
    wake: Arc<Notify>,
    /// The queue of timed background tasks
    tasks: BTreeMap<chrono::DateTime<chrono::Utc>, Tasks>,
}

impl Scheduler {
    /// Create a new scheduler loop
    ///
    /// # Arguments
    ///
    /// * `conf` - The Berth config
    /// * `store` - The store to commit decisions through
    /// * `state` - The cache and queues shared with the ingest task
    /// * `wake` - The notifier the ingest task signals changes on
    pub fn new(
        conf: Conf,
        store: Arc<dyn Store>,
        state: Arc<Mutex<State>>,
        wake: Arc<Notify>,
    ) -> Self {
        let tasks = Tasks::setup_queue(&conf);
        Scheduler {
            conf,
            store,
            state,
            wake,
            tasks,
        }
    }

    /// Lock the shared scheduling state
    fn lock(&self) -> MutexGuard<'_, State> {
        // a poisoned scheduling lock is unrecoverable
        self.state.lock().expect("scheduling lock poisoned")
    }

    /// Run scheduling cycles until told to shut down
    ///
    /// # Arguments
    ///
    /// * `shutdown` - The signal that unwinds this loop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let tick = std::time::Duration::from_millis(self.conf.berth.admitter.tick_millis);
        loop {
            self.spawn_tasks().await?;
            self.cycle().await?;
            // sleep until the next tick or a cache change wakes us early
            tokio::select! {
                () = tokio::time::sleep(tick) => (),
                () = self.wake.notified() => (),
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

    /// Run any timed background tasks that have come due
    #[instrument(name = "Scheduler::spawn_tasks", skip_all, err(Debug))]
    async fn spawn_tasks(&mut self) -> Result<(), Error> {
        let now = chrono::Utc::now();
        // pull out everything that is due
        let later = self.tasks.split_off(&now);
        let due = std::mem::replace(&mut self.tasks, later);
        for (_, task) in due {
            match task {
                Tasks::StatusFlush => self.flush_status().await?,
                Tasks::LogUsage => self.log_usage(),
            }
            // put this task back at its next start time
            let mut start = now + chrono::Duration::seconds(task.delay(&self.conf));
            while self.tasks.contains_key(&start) {
                start += chrono::Duration::seconds(1);
            }
            self.tasks.insert(start, task);
        }
        Ok(())
    }

    /// Mirror every queues counters and usage onto its external record
    async fn flush_status(&self) -> Result<(), Error> {
        // gather the counters under the lock then write without it
        let statuses = {
            let state = self.lock();
            state
                .cache
                .queue_names()
                .into_iter()
                .filter_map(|name| {
                    let pending = state.queues.pending_count(&name);
                    state
                        .cache
                        .queue_status(&name, pending)
                        .map(|status| (name, status))
                })
                .collect::<Vec<_>>()
        };
        for (name, status) in statuses {
            if let Err(error) = self.store.update_queue_status(&name, status).await {
                event!(
                    Level::WARN,
                    queue = name,
                    error = error.msg(),
                    msg = "Failed to mirror queue status",
                );
            }
        }
        Ok(())
    }

    /// Log the current usage of every cluster queue
    fn log_usage(&self) {
        let state = self.lock();
        for name in state.cache.queue_names() {
            if let Some(queue) = state.cache.cluster_queue(&name) {
                for flavor in queue.usage_status() {
                    for usage in &flavor.resources {
                        event!(
                            Level::INFO,
                            queue = name,
                            flavor = flavor.name,
                            resource = usage.name.to_string(),
                            used = usage.total,
                        );
                    }
                }
            }
        }
    }

    /// Run a single scheduling cycle
    #[instrument(name = "Scheduler::cycle", skip_all, err(Debug))]
    pub async fn cycle(&self) -> Result<(), Error> {
        // snapshot the cache and pending queues under the lock
        let (mut snapshot, mut pending) = {
            let state = self.lock();
            (state.cache.snapshot(), state.queues.cycle_queues())
        };
        let gating = self.conf.berth.admitter.pods_ready_timeout.is_some();
        // nothing is admitted while an admitted workload has unready pods
        if gating && !snapshot.all_admitted_ready() {
            event!(Level::DEBUG, msg = "Waiting on PodsReady for admitted workloads");
            return Ok(());
        }
        // only queues the snapshot knows are schedulable this cycle
        pending.retain(|name, _| snapshot.cluster_queues.contains_key(name));
        let (staged, evictions, inadmissible) = self.assess(&mut snapshot, pending, gating);
        self.commit(staged, evictions, inadmissible).await
    }

    /// Walk the pending heads in global order and stage decisions
    ///
    /// # Arguments
    ///
    /// * `snapshot` - The snapshot usage is staged against
    /// * `pending` - The ordered pending workloads per queue
    /// * `gating` - Whether PodsReady gating limits admissions to one
    fn assess(
        &self,
        snapshot: &mut Snapshot,
        mut pending: HashMap<String, VecDeque<WorkloadInfo>>,
        gating: bool,
    ) -> (Vec<StagedAdmission>, Vec<WorkloadInfo>, Vec<(String, String)>) {
        let mut staged = Vec::default();
        let mut evictions = Vec::default();
        let mut inadmissible = Vec::default();
        let mut planned_victims: HashSet<String> = HashSet::default();
        // seed the global order with the head of every queue
        let mut heads: BTreeMap<QueueOrderKey, WorkloadInfo> = BTreeMap::default();
        for queue in pending.values_mut() {
            if let Some(head) = queue.pop_front() {
                heads.insert(QueueOrderKey::new(&head), head);
            }
        }
        while let Some((_, info)) = heads.pop_first() {
            // with gating on only one workload may enter per cycle
            if gating && !staged.is_empty() {
                break;
            }
            let key = info.key();
            let queue_name = info.cluster_queue.clone();
            let (strategy, assignment) = {
                let Some(queue) = snapshot.cluster_queues.get(&queue_name) else {
                    continue;
                };
                // the queues namespace selector gates admission entirely
                let assignment = match namespace_allowed(queue.namespace_selector.as_ref(), &info) {
                    Ok(true) => Ok(assigner::assign_flavors(
                        &info,
                        queue,
                        snapshot.cohort_of(queue),
                        &snapshot.flavors,
                    )),
                    Ok(false) => {
                        Err("Workload namespace does not match ClusterQueue selector".to_owned())
                    }
                    Err(error) => Err(error.msg()),
                };
                (queue.strategy, assignment)
            };
            let mut admitted = false;
            match assignment {
                Ok(assignment) => match assignment.representative_mode() {
                    AssignmentMode::Fit => {
                        // charge the overlay so later heads see this usage
                        let usage = assignment.usage().clone();
                        for (flavor, resources) in &usage {
                            for (resource, quantity) in resources {
                                snapshot.add_usage(&queue_name, flavor, resource, *quantity);
                            }
                        }
                        staged.push(StagedAdmission {
                            admission: assignment.to_admission(&queue_name),
                            info,
                        });
                        admitted = true;
                    }
                    AssignmentMode::Preempt => {
                        match preempt::plan(&info, &assignment, snapshot, &queue_name) {
                            // decline plans that overlap victims already claimed
                            Some(victims)
                                if victims.iter().all(|v| !planned_victims.contains(&v.key())) =>
                            {
                                for victim in victims {
                                    planned_victims.insert(victim.key());
                                    evictions.push(victim);
                                }
                                inadmissible.push((
                                    key,
                                    "Waiting for preempted workloads to release quota".to_owned(),
                                ));
                            }
                            _ => inadmissible.push((key, assignment.message())),
                        }
                    }
                    AssignmentMode::NoFit => inadmissible.push((key, assignment.message())),
                },
                Err(reason) => inadmissible.push((key, reason)),
            }
            // a strict FIFO queue is done for the cycle once its head fails
            if admitted || strategy == QueueingStrategy::BestEffortFifo {
                if let Some(next) = pending.get_mut(&queue_name).and_then(VecDeque::pop_front) {
                    heads.insert(QueueOrderKey::new(&next), next);
                }
            }
        }
        (staged, evictions, inadmissible)
    }

    /// Commit the cycles staged decisions through the store
    ///
    /// Commits land in head order. A failed commit only requeues its own
    /// workload; everything else in the cycle stands.
    ///
    /// # Arguments
    ///
    /// * `staged` - The admissions to persist
    /// * `evictions` - The preemption victims to evict
    /// * `inadmissible` - The reasons recorded for skipped workloads
    async fn commit(
        &self,
        staged: Vec<StagedAdmission>,
        evictions: Vec<WorkloadInfo>,
        inadmissible: Vec<(String, String)>,
    ) -> Result<(), Error> {
        // evict planned victims first so their quota starts draining
        for victim in evictions {
            let key = victim.key();
            let outcome = self
                .store
                .evict(
                    &key,
                    victim.workload.resource_version,
                    EVICTED_BY_PREEMPTION,
                    "Preempted to accommodate a higher priority workload",
                )
                .await;
            match outcome {
                Ok(_) => event!(Level::INFO, workload = key, msg = "Evicted for preemption"),
                Err(error) => event!(
                    Level::WARN,
                    workload = key,
                    error = error.msg(),
                    msg = "Failed to evict preemption victim",
                ),
            }
        }
        for stage in staged {
            let key = stage.info.key();
            let queue = stage.admission.cluster_queue.clone();
            let outcome = self
                .store
                .admit(&key, stage.info.workload.resource_version, stage.admission)
                .await;
            match outcome {
                Ok(updated) => {
                    // apply the admission to the cache right away so the
                    // next cycle does not depend on watch delivery
                    let mut state = self.lock();
                    state.queues.remove(&key);
                    state.cache.add_workload(WorkloadInfo::new(updated));
                    event!(Level::INFO, workload = key, queue = queue, msg = "Admitted workload");
                }
                Err(error) if error.is_transient() => {
                    // the workload is still pending so the next tick retries
                    event!(
                        Level::WARN,
                        workload = key,
                        error = error.msg(),
                        msg = "Admission commit failed, will retry",
                    );
                }
                Err(error) => {
                    event!(
                        Level::ERROR,
                        workload = key,
                        error = error.msg(),
                        msg = "Admission commit failed",
                    );
                }
            }
        }
        // surface the reasons pending workloads were skipped
        if !inadmissible.is_empty() {
            let mut state = self.lock();
            for (key, reason) in inadmissible {
                event!(Level::INFO, workload = key, reason = reason, msg = "Workload not admitted");
                state.queues.note_inadmissible(&key, reason);
            }
        }
        Ok(())
    }
}
