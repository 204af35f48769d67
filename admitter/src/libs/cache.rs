//! A cache of the cluster queues, cohorts, and flavors Berth admits against
//!
//! The cache is the authoritative in-memory projection of external state.
//! Every mutation and every snapshot happens under a single exclusive lock
//! owned by the caller so the scheduler always sees a consistent view.

use std::collections::{HashMap, HashSet};
use berth::models::{
    ClusterQueue, ClusterQueueStatus, FlavorQuotas, FlavorResourceQuantities, FlavorUsage,
    LabelSelector, LocalQueue, PreemptionPolicy, QueueingStrategy, ResourceFlavor, ResourceName,
    ResourceQuota, ResourceUsage, WorkloadInfo,
};
use tracing::{event, Level};

mod snapshot;

pub use snapshot::{CohortSnapshot, Snapshot, SnapshotQueue};

/// Add a quantity to a flavor/resource usage map
///
/// # Arguments
///
/// * `map` - The usage map to update
/// * `flavor` - The flavor the quantity is charged in
/// * `resource` - The resource the quantity is charged for
/// * `quantity` - The quantity to add which may be negative
pub(crate) fn charge(
    map: &mut FlavorResourceQuantities,
    flavor: &str,
    resource: &ResourceName,
    quantity: i64,
) {
    *map.entry(flavor.to_owned())
        .or_default()
        .entry(resource.clone())
        .or_default() += quantity;
}

/// Read a quantity from a flavor/resource usage map defaulting to 0
///
/// # Arguments
///
/// * `map` - The usage map to read
/// * `flavor` - The flavor to read usage in
/// * `resource` - The resource to read usage for
pub(crate) fn charged(
    map: &FlavorResourceQuantities,
    flavor: &str,
    resource: &ResourceName,
) -> i64 {
    map.get(flavor)
        .and_then(|resources| resources.get(resource))
        .copied()
        .unwrap_or_default()
}

/// An ordered group of flavors covering the same set of resources
#[derive(Debug, Clone)]
pub struct QuotaGroup {
    /// The resources every flavor in this group covers
    pub covered: HashSet<ResourceName>,
    /// The node label keys that appear on any flavor in this group
    pub label_keys: HashSet<String>,
    /// The flavors in this group in preference order
    pub flavors: Vec<FlavorQuotas>,
}

impl QuotaGroup {
    /// Get the quota for a resource in one of this groups flavors
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to look in
    /// * `resource` - The resource to get the quota for
    #[must_use]
    pub fn quota(&self, flavor: &str, resource: &ResourceName) -> Option<&ResourceQuota> {
        self.flavors
            .iter()
            .find(|quotas| quotas.name == flavor)
            .and_then(|quotas| quotas.resources.iter().find(|quota| &quota.name == resource))
    }
}

/// A cluster queue as projected into the cache
#[derive(Debug, Clone)]
pub struct CachedQueue {
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
    /// The usage charged against this queue by flavor and resource
    pub usage: FlavorResourceQuantities,
    /// The admitted workloads holding usage in this queue
    pub workloads: HashMap<String, WorkloadInfo>,
    /// Whether this queue is well formed and schedulable
    pub active: bool,
}

impl CachedQueue {
    /// Project an external cluster queue record into the cache
    ///
    /// A malformed record still produces a queryable queue but marks it
    /// inactive so the scheduler skips it.
    ///
    /// # Arguments
    ///
    /// * `queue` - The external record to project
    fn new(queue: ClusterQueue) -> Self {
        let mut active = true;
        let mut seen = HashSet::new();
        let mut groups = Vec::with_capacity(queue.resource_groups.len());
        for group in queue.resource_groups {
            let covered = group
                .covered_resources
                .iter()
                .cloned()
                .collect::<HashSet<ResourceName>>();
            // a resource may only be covered by a single group
            if covered.iter().any(|resource| !seen.insert(resource.clone())) {
                event!(
                    Level::ERROR,
                    queue = queue.name,
                    msg = "Resource covered by multiple groups",
                );
                active = false;
            }
            // every flavor must cover exactly the groups resource set
            for quotas in &group.flavors {
                let flavor_covers = quotas
                    .resources
                    .iter()
                    .map(|quota| quota.name.clone())
                    .collect::<HashSet<ResourceName>>();
                if flavor_covers != covered {
                    event!(
                        Level::ERROR,
                        queue = queue.name,
                        flavor = quotas.name,
                        msg = "Flavor does not cover the groups resource set",
                    );
                    active = false;
                }
            }
            groups.push(QuotaGroup {
                covered,
                label_keys: HashSet::default(),
                flavors: group.flavors,
            });
        }
        // start the usage map zeroed for every quota so status reports 0s
        let mut usage = FlavorResourceQuantities::default();
        for group in &groups {
            for quotas in &group.flavors {
                for quota in &quotas.resources {
                    charge(&mut usage, &quotas.name, &quota.name, 0);
                }
            }
        }
        CachedQueue {
            name: queue.name,
            cohort: queue.cohort.filter(|name| !name.is_empty()),
            strategy: queue.queueing_strategy,
            preemption: queue.preemption,
            namespace_selector: queue.namespace_selector,
            groups,
            usage,
            workloads: HashMap::default(),
            active,
        }
    }

    /// Recompute the label keys of every group from the flavor catalogue
    ///
    /// # Arguments
    ///
    /// * `flavors` - The current flavor catalogue
    fn update_label_keys(&mut self, flavors: &HashMap<String, ResourceFlavor>) {
        for group in &mut self.groups {
            let mut keys = HashSet::default();
            for quotas in &group.flavors {
                if let Some(flavor) = flavors.get(&quotas.name) {
                    keys.extend(flavor.node_labels.keys().cloned());
                }
            }
            group.label_keys = keys;
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

    /// Sum this queues nominal quotas into a cohort requestable map
    ///
    /// # Arguments
    ///
    /// * `requestable` - The map to sum into
    fn sum_nominals(&self, requestable: &mut FlavorResourceQuantities) {
        for group in &self.groups {
            for quotas in &group.flavors {
                for quota in &quotas.resources {
                    charge(requestable, &quotas.name, &quota.name, quota.nominal);
                }
            }
        }
    }

    /// Sum this queues usage into a cohort usage map
    ///
    /// # Arguments
    ///
    /// * `usage` - The map to sum into
    fn sum_usage(&self, usage: &mut FlavorResourceQuantities) {
        for (flavor, resources) in &self.usage {
            for (resource, quantity) in resources {
                charge(usage, flavor, resource, *quantity);
            }
        }
    }

    /// Build the flavor usage list for this queues external status
    #[must_use]
    pub fn usage_status(&self) -> Vec<FlavorUsage> {
        let mut flavors = self
            .usage
            .iter()
            .map(|(name, resources)| {
                let mut resources = resources
                    .iter()
                    .map(|(resource, total)| ResourceUsage {
                        name: resource.clone(),
                        total: *total,
                    })
                    .collect::<Vec<ResourceUsage>>();
                resources.sort_by(|a, b| a.name.cmp(&b.name));
                FlavorUsage {
                    name: name.clone(),
                    resources,
                }
            })
            .collect::<Vec<FlavorUsage>>();
        flavors.sort_by(|a, b| a.name.cmp(&b.name));
        flavors
    }
}

/// The aggregate quota and usage of a set of queues that borrow together
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    /// The queues in this cohort
    pub members: HashSet<String>,
    /// The summed nominal quotas of all members
    pub requestable: FlavorResourceQuantities,
    /// The summed usage of all members
    pub usage: FlavorResourceQuantities,
}

/// The authoritative in-memory projection of external state
#[derive(Default)]
pub struct Cache {
    /// The cluster queues by name
    cluster_queues: HashMap<String, CachedQueue>,
    /// The cohort aggregates by name
    cohorts: HashMap<String, Cohort>,
    /// The flavor catalogue by name
    flavors: HashMap<String, ResourceFlavor>,
    /// The local queue bindings by namespace/name key
    local_queues: HashMap<String, String>,
    /// Which cluster queue each admitted workload is tracked in
    admitted: HashMap<String, String>,
}

impl Cache {
    /// Create a new empty cache
    #[must_use]
    pub fn new() -> Self {
        Cache::default()
    }

    /// Project a cluster queue record into the cache
    ///
    /// Usage and admitted workloads survive an update. The queueing
    /// strategy is immutable after creation.
    ///
    /// # Arguments
    ///
    /// * `queue` - The external record to project
    pub fn add_or_update_cluster_queue(&mut self, queue: ClusterQueue) {
        let mut cached = CachedQueue::new(queue);
        cached.update_label_keys(&self.flavors);
        let mut stale_cohort = None;
        if let Some(existing) = self.cluster_queues.remove(&cached.name) {
            // the queueing strategy cannot change after creation
            if existing.strategy != cached.strategy {
                event!(
                    Level::WARN,
                    queue = cached.name,
                    msg = "Ignoring queueing strategy change",
                );
                cached.strategy = existing.strategy;
            }
            // carry usage and admitted workloads over to the new projection
            cached.usage = existing.usage;
            cached.workloads = existing.workloads;
            stale_cohort = existing.cohort;
        }
        let fresh_cohort = cached.cohort.clone();
        self.cluster_queues.insert(cached.name.clone(), cached);
        self.rebuild_cohort(stale_cohort);
        self.rebuild_cohort(fresh_cohort);
    }

    /// Remove a cluster queue from the cache
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the cluster queue to remove
    pub fn delete_cluster_queue(&mut self, name: &str) {
        if let Some(removed) = self.cluster_queues.remove(name) {
            // drop the admitted index entries for this queues workloads
            for key in removed.workloads.keys() {
                self.admitted.remove(key);
            }
            self.rebuild_cohort(removed.cohort);
        }
    }

    /// Add or update a flavor in the catalogue
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to add or update
    pub fn add_or_update_flavor(&mut self, flavor: ResourceFlavor) {
        self.flavors.insert(flavor.name.clone(), flavor);
        self.refresh_label_keys();
    }

    /// Remove a flavor from the catalogue
    ///
    /// Queues that reference it stay active and simply skip it during
    /// assignment.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the flavor to remove
    pub fn delete_flavor(&mut self, name: &str) {
        self.flavors.remove(name);
        self.refresh_label_keys();
    }

    /// Bind a local queue to its cluster queue
    ///
    /// # Arguments
    ///
    /// * `queue` - The local queue to bind
    pub fn add_or_update_local_queue(&mut self, queue: &LocalQueue) {
        self.local_queues.insert(queue.key(), queue.cluster_queue.clone());
    }

    /// Remove a local queue binding
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the local queue to remove
    pub fn delete_local_queue(&mut self, key: &str) {
        self.local_queues.remove(key);
    }

    /// Track an admitted workload and charge its usage
    ///
    /// Re-adding a workload that is already tracked refreshes its record,
    /// so replays of the same watch event are idempotent.
    ///
    /// # Arguments
    ///
    /// * `info` - The admitted workload to track
    pub fn add_workload(&mut self, info: WorkloadInfo) {
        let key = info.key();
        // release any prior record before charging the fresh one
        self.delete_workload(&key);
        let Some(queue) = self.cluster_queues.get_mut(&info.cluster_queue) else {
            event!(
                Level::WARN,
                workload = key,
                queue = info.cluster_queue,
                msg = "Admitted workload targets an unknown queue",
            );
            return;
        };
        for (flavor, resource, quantity) in info.usage() {
            charge(&mut queue.usage, &flavor, &resource, quantity);
        }
        let cohort = queue.cohort.clone();
        self.admitted.insert(key.clone(), info.cluster_queue.clone());
        queue.workloads.insert(key, info);
        self.rebuild_cohort(cohort);
    }

    /// Stop tracking a workload and release its usage
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the workload to release
    pub fn delete_workload(&mut self, key: &str) {
        let Some(queue_name) = self.admitted.remove(key) else {
            return;
        };
        if let Some(queue) = self.cluster_queues.get_mut(&queue_name) {
            if let Some(info) = queue.workloads.remove(key) {
                for (flavor, resource, quantity) in info.usage() {
                    charge(&mut queue.usage, &flavor, &resource, -quantity);
                }
            }
            let cohort = queue.cohort.clone();
            self.rebuild_cohort(cohort);
        }
    }

    /// Resolve the cluster queue a local queue key is bound to
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the local queue
    #[must_use]
    pub fn resolve_local_queue(&self, key: &str) -> Option<&String> {
        self.local_queues.get(key)
    }

    /// Get a cluster queue by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the cluster queue to get
    #[must_use]
    pub fn cluster_queue(&self, name: &str) -> Option<&CachedQueue> {
        self.cluster_queues.get(name)
    }

    /// Get a cohort aggregate by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the cohort to get
    #[must_use]
    pub fn cohort(&self, name: &str) -> Option<&Cohort> {
        self.cohorts.get(name)
    }

    /// Build the external status counters for a cluster queue
    ///
    /// # Arguments
    ///
    /// * `name` - The cluster queue to build counters for
    /// * `pending` - The pending count from the queue manager
    #[must_use]
    pub fn queue_status(&self, name: &str, pending: u32) -> Option<ClusterQueueStatus> {
        self.cluster_queues.get(name).map(|queue| ClusterQueueStatus {
            pending_workloads: pending,
            admitted_workloads: queue.workloads.len() as u32,
            flavors_usage: queue.usage_status(),
        })
    }

    /// The names of all cluster queues in the cache
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.cluster_queues.keys().cloned().collect()
    }

    /// Take a detached snapshot the scheduler can read without the lock
    ///
    /// Inactive queues are left out so the scheduler never admits against
    /// a malformed quota model.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let cluster_queues = self
            .cluster_queues
            .iter()
            .filter(|(_, queue)| queue.active)
            .map(|(name, queue)| (name.clone(), SnapshotQueue::new(queue)))
            .collect();
        let cohorts = self
            .cohorts
            .iter()
            .map(|(name, cohort)| (name.clone(), CohortSnapshot::new(name, cohort)))
            .collect();
        Snapshot {
            cluster_queues,
            cohorts,
            flavors: self.flavors.clone(),
        }
    }

    /// Recompute a cohorts aggregates by summing its members
    ///
    /// # Arguments
    ///
    /// * `name` - The cohort to recompute where None is a no op
    fn rebuild_cohort(&mut self, name: Option<String>) {
        let Some(name) = name else {
            return;
        };
        let mut cohort = Cohort::default();
        for queue in self.cluster_queues.values() {
            if queue.cohort.as_deref() == Some(&name) {
                cohort.members.insert(queue.name.clone());
                queue.sum_nominals(&mut cohort.requestable);
                queue.sum_usage(&mut cohort.usage);
            }
        }
        // a cohort with no members left is dropped entirely
        if cohort.members.is_empty() {
            self.cohorts.remove(&name);
        } else {
            self.cohorts.insert(name, cohort);
        }
    }

    /// Recompute the label keys of every queue from the flavor catalogue
    fn refresh_label_keys(&mut self) {
        for queue in self.cluster_queues.values_mut() {
            queue.update_label_keys(&self.flavors);
        }
    }
}
