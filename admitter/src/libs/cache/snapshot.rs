//! Detached snapshots the scheduler reads and overlays without the cache lock

use std::collections::HashMap;

use berth::models::{
    FlavorResourceQuantities, LabelSelector, PreemptionPolicy, QueueingStrategy, ResourceFlavor,
    ResourceName, WorkloadInfo,
};

use super::{charge, charged, CachedQueue, Cohort, QuotaGroup};

/// A cluster queue as captured in a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotQueue {
    /// The name of this cluster queue
    pub name: String,
    /// The cohort this queue may borrow within
    pub cohort: Option<String>,
    /// How this queue orders and drains pending workloads
    pub strategy: QueueingStrategy,
    /// The preemption policy for this queue
    pub preemption: PreemptionPolicy,
    /// The namespaces allowed to submit to this queue
    pub namespace_selector: Option<LabelSelector>,
    /// The quota groups this queue admits against
    pub groups: Vec<QuotaGroup>,
    /// The usage charged against this queue plus the cycles overlay
    pub usage: FlavorResourceQuantities,
    /// The admitted workloads holding usage in this queue
    pub workloads: HashMap<String, WorkloadInfo>,
}

impl SnapshotQueue {
    /// Capture a cached queue into a snapshot
    ///
    /// # Arguments
    ///
    /// * `queue` - The cached queue to capture
    pub(super) fn new(queue: &CachedQueue) -> Self {
        SnapshotQueue {
            name: queue.name.clone(),
            cohort: queue.cohort.clone(),
            strategy: queue.strategy,
            preemption: queue.preemption,
            namespace_selector: queue.namespace_selector.clone(),
            groups: queue.groups.clone(),
            usage: queue.usage.clone(),
            workloads: queue.workloads.clone(),
        }
    }

    /// Get the group covering a resource if any does
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to find the group for
    #[must_use]
    pub fn group_for(&self, resource: &ResourceName) -> Option<&QuotaGroup> {
        self.groups.iter().find(|group| group.covered.contains(resource))
    }

    /// Check if any group of this queue covers the pods pseudo resource
    #[must_use]
    pub fn covers_pods(&self) -> bool {
        self.group_for(&ResourceName::Pods).is_some()
    }

    /// Read this queues usage for a flavor and resource
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to read usage in
    /// * `resource` - The resource to read usage for
    #[must_use]
    pub fn usage_of(&self, flavor: &str, resource: &ResourceName) -> i64 {
        charged(&self.usage, flavor, resource)
    }
}

/// A cohort aggregate as captured in a snapshot
#[derive(Debug, Clone)]
pub struct CohortSnapshot {
    /// The name of this cohort
    pub name: String,
    /// The summed nominal quotas of all members
    pub requestable: FlavorResourceQuantities,
    /// The summed usage of all members plus the cycles overlay
    pub usage: FlavorResourceQuantities,
}

impl CohortSnapshot {
    /// Capture a cohort aggregate into a snapshot
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this cohort
    /// * `cohort` - The aggregate to capture
    pub(super) fn new(name: &str, cohort: &Cohort) -> Self {
        CohortSnapshot {
            name: name.to_owned(),
            requestable: cohort.requestable.clone(),
            usage: cohort.usage.clone(),
        }
    }

    /// Read this cohorts usage for a flavor and resource
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to read usage in
    /// * `resource` - The resource to read usage for
    #[must_use]
    pub fn usage_of(&self, flavor: &str, resource: &ResourceName) -> i64 {
        charged(&self.usage, flavor, resource)
    }

    /// Read this cohorts requestable quota for a flavor and resource
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to read quota in
    /// * `resource` - The resource to read quota for
    #[must_use]
    pub fn requestable_of(&self, flavor: &str, resource: &ResourceName) -> i64 {
        charged(&self.requestable, flavor, resource)
    }
}

/// A detached view of the cache plus the cycle-local usage overlay
///
/// The scheduler charges tentative admissions straight into this snapshot
/// so two borrowers in the same cohort cannot both claim the same free
/// capacity within one cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The active cluster queues by name
    pub cluster_queues: HashMap<String, SnapshotQueue>,
    /// The cohort aggregates by name
    pub cohorts: HashMap<String, CohortSnapshot>,
    /// The flavor catalogue by name
    pub flavors: HashMap<String, ResourceFlavor>,
}

impl Snapshot {
    /// Get the cohort aggregate a queue belongs to if any
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to get the cohort for
    #[must_use]
    pub fn cohort_of(&self, queue: &SnapshotQueue) -> Option<&CohortSnapshot> {
        queue.cohort.as_ref().and_then(|name| self.cohorts.get(name))
    }

    /// Charge tentative usage against a queue and its cohort
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to charge
    /// * `flavor` - The flavor the usage is charged in
    /// * `resource` - The resource the usage is charged for
    /// * `quantity` - The quantity to charge which may be negative
    pub fn add_usage(
        &mut self,
        queue: &str,
        flavor: &str,
        resource: &ResourceName,
        quantity: i64,
    ) {
        let Some(queue) = self.cluster_queues.get_mut(queue) else {
            return;
        };
        charge(&mut queue.usage, flavor, resource, quantity);
        if let Some(cohort) = &queue.cohort {
            if let Some(cohort) = self.cohorts.get_mut(cohort) {
                charge(&mut cohort.usage, flavor, resource, quantity);
            }
        }
    }

    /// Remove an admitted workload and release its usage
    ///
    /// Used by the preemption planner to simulate evicting victims.
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue the workload is admitted into
    /// * `key` - The namespace/name key of the workload to remove
    pub fn remove_workload(&mut self, queue: &str, key: &str) -> Option<WorkloadInfo> {
        let info = self.cluster_queues.get_mut(queue)?.workloads.remove(key)?;
        for (flavor, resource, quantity) in info.usage() {
            self.add_usage(queue, &flavor, &resource, -quantity);
        }
        Some(info)
    }

    /// Check whether every admitted workload has reached pod readiness
    ///
    /// Workloads mid eviction still hold usage and still gate admission
    /// until the acknowledgement releases them.
    #[must_use]
    pub fn all_admitted_ready(&self) -> bool {
        self.cluster_queues.values().all(|queue| {
            queue
                .workloads
                .values()
                .all(|info| info.workload.pods_ready())
        })
    }
}
