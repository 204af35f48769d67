//! Wrappers for all objects within Berth

pub mod flavors;
pub mod queues;
pub mod resources;
pub mod workloads;

pub use flavors::{
    LabelSelector, NodeSelectorRequirement, NodeSelectorTerm, ResourceFlavor, SelectorOperator,
    Taint, TaintEffect, Toleration, TolerationOperator, NAMESPACE_NAME_LABEL,
};
pub use queues::{
    ClusterQueue, ClusterQueueStatus, FlavorQuotas, FlavorUsage, LocalQueue, PreemptionPolicy,
    PreemptionRule, QueueingStrategy, ReclaimRule, ResourceGroup, ResourceQuota, ResourceUsage,
};
pub use resources::{format_quantity, FlavorResourceQuantities, Requests, ResourceName};
pub use workloads::{
    Admission, Condition, ConditionType, Container, PodSet, PodSetAdmission, PodSetResources,
    PodTemplate, Workload, WorkloadInfo, WorkloadSpec, WorkloadStatus, EVICTED_BY_DEACTIVATION,
    EVICTED_BY_PODS_READY_TIMEOUT, EVICTED_BY_PREEMPTION,
};
