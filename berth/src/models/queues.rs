//! Cluster queues, their quotas, and the local queues that feed them

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use super::flavors::LabelSelector;
use super::resources::ResourceName;

/// How a cluster queue orders and drains its pending workloads
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueingStrategy {
    /// The head blocks the queue until it can be admitted
    #[serde(rename = "StrictFIFO")]
    StrictFifo,
    /// Later workloads may be admitted past a stuck head
    #[default]
    #[serde(rename = "BestEffortFIFO")]
    BestEffortFifo,
}

impl Display for QueueingStrategy {
    /// Write our queueing strategy to this formatter
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueingStrategy::StrictFifo => write!(f, "StrictFIFO"),
            QueueingStrategy::BestEffortFifo => write!(f, "BestEffortFIFO"),
        }
    }
}

impl FromStr for QueueingStrategy {
    type Err = &'static str;

    /// Cast a str to a `QueueingStrategy`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "StrictFIFO" => Ok(QueueingStrategy::StrictFifo),
            "BestEffortFIFO" => Ok(QueueingStrategy::BestEffortFifo),
            _ => Err("queueing strategy must be StrictFIFO or BestEffortFIFO"),
        }
    }
}

/// When workloads in the same cluster queue may be preempted
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptionRule {
    /// Never preempt within the cluster queue
    #[default]
    Never,
    /// Preempt workloads with a strictly lower priority
    LowerPriority,
}

/// When borrowed quota may be reclaimed from cohort members
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimRule {
    /// Never reclaim quota from the cohort
    #[default]
    Never,
    /// Reclaim from borrowers with a strictly lower priority
    LowerPriority,
    /// Reclaim from any borrower
    Any,
}

/// The preemption policy carried on a cluster queue
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreemptionPolicy {
    /// When workloads in this cluster queue may be preempted
    #[serde(default)]
    pub within_cluster_queue: PreemptionRule,
    /// When borrowed quota may be reclaimed from cohort members
    #[serde(default)]
    pub reclaim_within_cohort: ReclaimRule,
}

/// The quota a cluster queue holds for one resource in one flavor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceQuota {
    /// The resource this quota covers
    pub name: ResourceName,
    /// The guaranteed quantity of this resource
    pub nominal: i64,
    /// The most this queue may borrow from its cohort beyond nominal
    #[serde(default)]
    pub borrowing_limit: Option<i64>,
}

/// The quotas a cluster queue holds in a single flavor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlavorQuotas {
    /// The name of the flavor these quotas are in
    pub name: String,
    /// The per resource quotas in this flavor
    pub resources: Vec<ResourceQuota>,
}

/// An ordered list of flavors that jointly cover the same resources
///
/// A workload must pick a single flavor from the group that satisfies
/// every covered resource at once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceGroup {
    /// The resources every flavor in this group covers
    pub covered_resources: Vec<ResourceName>,
    /// The flavors in this group in preference order
    pub flavors: Vec<FlavorQuotas>,
}

/// A named quota container workloads are admitted into
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterQueue {
    /// The name of this cluster queue
    pub name: String,
    /// The cohort this queue may borrow unused quota within
    #[serde(default)]
    pub cohort: Option<String>,
    /// How this queue orders and drains pending workloads
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
    /// The namespaces allowed to submit to this queue where None allows all
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    /// The resource groups this queue holds quota for
    pub resource_groups: Vec<ResourceGroup>,
    /// The preemption policy for this queue
    #[serde(default)]
    pub preemption: PreemptionPolicy,
}

impl ClusterQueue {
    /// Create a new cluster queue with a single resource group
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this cluster queue
    /// * `group` - The resource group holding this queues quota
    pub fn new<T: Into<String>>(name: T, group: ResourceGroup) -> Self {
        ClusterQueue {
            name: name.into(),
            cohort: None,
            queueing_strategy: QueueingStrategy::default(),
            namespace_selector: None,
            resource_groups: vec![group],
            preemption: PreemptionPolicy::default(),
        }
    }
}

/// The usage of a single resource reported on a cluster queues status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceUsage {
    /// The resource this usage is for
    pub name: ResourceName,
    /// The total quantity in use
    pub total: i64,
}

/// The usage of a single flavor reported on a cluster queues status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlavorUsage {
    /// The flavor this usage is in
    pub name: String,
    /// The per resource usage in this flavor
    pub resources: Vec<ResourceUsage>,
}

/// The counters mirrored onto a cluster queues external record
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClusterQueueStatus {
    /// The number of workloads waiting in this queue
    pub pending_workloads: u32,
    /// The number of workloads admitted into this queue
    pub admitted_workloads: u32,
    /// The usage of every flavor this queue holds quota in
    #[serde(default)]
    pub flavors_usage: Vec<FlavorUsage>,
}

/// A namespaced queue binding workloads to a cluster queue
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocalQueue {
    /// The namespace this local queue lives in
    pub namespace: String,
    /// The name of this local queue
    pub name: String,
    /// The cluster queue this local queue feeds
    pub cluster_queue: String,
}

impl LocalQueue {
    /// The namespace/name key for this local queue
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
