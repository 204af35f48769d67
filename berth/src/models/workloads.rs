//! Workloads and the admission state tracked on them
//!
//! A workload is a group of pod sets queued for admission into a cluster
//! queue. Admission binds every requested resource of every pod set to a
//! flavor and is tracked through the condition list.

use chrono::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

use super::flavors::{NodeSelectorTerm, Toleration};
use super::resources::{Requests, ResourceName};

/// The reason set on Evicted when a workload exceeded its PodsReady timeout
pub const EVICTED_BY_PODS_READY_TIMEOUT: &str = "PodsReadyTimeout";
/// The reason set on Evicted when a workload was preempted
pub const EVICTED_BY_PREEMPTION: &str = "Preempted";
/// The reason set on Evicted when a workload was deactivated externally
pub const EVICTED_BY_DEACTIVATION: &str = "Deactivated";

/// The longest message a condition will carry before truncation
const MAX_CONDITION_MESSAGE: usize = 32 * 1024;

/// Helps serde default a workload uid
fn default_uid() -> Uuid {
    Uuid::new_v4()
}

/// Helps serde default a workload creation time
fn default_created() -> DateTime<Utc> {
    Utc::now()
}

/// The kinds of conditions tracked on a workload
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    /// This workload holds an admission into a cluster queue
    Admitted,
    /// This workloads admission is being revoked
    Evicted,
    /// All pods of this admitted workload have reached readiness
    PodsReady,
    /// This workload has run to completion
    Finished,
}

/// A single condition on a workload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Condition {
    /// The kind of condition this is
    pub kind: ConditionType,
    /// Whether this condition currently holds
    pub status: bool,
    /// When this conditions status last flipped
    pub last_transition: DateTime<Utc>,
    /// A machine readable reason for the latest transition
    pub reason: String,
    /// A human readable message for the latest transition
    pub message: String,
}

impl Condition {
    /// Create a new condition stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of condition to create
    /// * `status` - Whether this condition holds
    /// * `reason` - A machine readable reason
    /// * `message` - A human readable message
    pub fn new<R: Into<String>, M: Into<String>>(
        kind: ConditionType,
        status: bool,
        reason: R,
        message: M,
    ) -> Self {
        let mut message = message.into();
        message.truncate(MAX_CONDITION_MESSAGE);
        Condition {
            kind,
            status,
            last_transition: Utc::now(),
            reason: reason.into(),
            message,
        }
    }
}

/// A single container within a pod template
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Container {
    /// The name of this container
    pub name: String,
    /// The resources this container requests
    #[serde(default)]
    pub requests: Requests,
}

/// The template every pod in a pod set is stamped from
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PodTemplate {
    /// The containers in this pod
    #[serde(default)]
    pub containers: Vec<Container>,
    /// The runtime class overhead added on top of container requests
    #[serde(default)]
    pub overhead: Requests,
    /// The node labels this pod requires exactly
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// The required node affinity terms where any one term may match
    #[serde(default)]
    pub required_affinity: Vec<NodeSelectorTerm>,
    /// The taints this pod tolerates
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

impl PodTemplate {
    /// Total the requests of a single pod including runtime overhead
    #[must_use]
    pub fn total_requests(&self) -> Requests {
        let mut total = Requests::default();
        for container in &self.containers {
            total.add(&container.requests);
        }
        total.add(&self.overhead);
        total
    }
}

/// A group of homogeneous pods within a workload
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PodSet {
    /// The name of this pod set
    pub name: String,
    /// The number of pods in this pod set
    pub count: u32,
    /// The template all pods in this pod set are stamped from
    pub template: PodTemplate,
}

/// The flavors and usage a single pod set was admitted with
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PodSetAdmission {
    /// The name of the pod set this admission covers
    pub name: String,
    /// The flavor each requested resource was bound to
    pub flavors: HashMap<ResourceName, String>,
    /// The total usage this pod set charges against its flavors
    pub resource_usage: Requests,
}

/// The admission binding a workload to a cluster queue and flavors
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Admission {
    /// The cluster queue this workload was admitted into
    pub cluster_queue: String,
    /// The per pod set flavor assignments
    pub pod_sets: Vec<PodSetAdmission>,
}

/// The spec of a workload
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkloadSpec {
    /// The pod sets this workload runs
    pub pod_sets: Vec<PodSet>,
    /// The local queue this workload was submitted to
    pub queue_name: String,
    /// The priority of this workload where higher is more important
    #[serde(default)]
    pub priority: i32,
    /// The name of the priority class this priority came from
    #[serde(default)]
    pub priority_class_name: Option<String>,
}

/// The status of a workload
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkloadStatus {
    /// The admission this workload currently holds if any
    #[serde(default)]
    pub admission: Option<Admission>,
    /// The conditions tracked on this workload
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A batch workload queued for admission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workload {
    /// The namespace this workload lives in
    pub namespace: String,
    /// The name of this workload
    pub name: String,
    /// The unique id of this workload
    #[serde(default = "default_uid")]
    pub uid: Uuid,
    /// The version of this workload used for optimistic concurrency
    #[serde(default)]
    pub resource_version: u64,
    /// When this workload was created
    #[serde(default = "default_created")]
    pub created: DateTime<Utc>,
    /// The spec of this workload
    pub spec: WorkloadSpec,
    /// The status of this workload
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    /// The namespace/name key for this workload
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The namespace/queue key for the local queue this workload targets
    #[must_use]
    pub fn queue_key(&self) -> String {
        format!("{}/{}", self.namespace, self.spec.queue_name)
    }

    /// Get a condition by kind if one is set
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of condition to get
    #[must_use]
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.status.conditions.iter().find(|cond| cond.kind == kind)
    }

    /// Check if a condition currently holds
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of condition to check
    #[must_use]
    pub fn condition_true(&self, kind: ConditionType) -> bool {
        self.condition(kind).is_some_and(|cond| cond.status)
    }

    /// Set a condition keeping the prior transition time on no op updates
    ///
    /// # Arguments
    ///
    /// * `condition` - The condition to set
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .status
            .conditions
            .iter_mut()
            .find(|existing| existing.kind == condition.kind)
        {
            Some(existing) => {
                // only bump the transition time when the status actually flips
                if existing.status == condition.status {
                    existing.reason = condition.reason;
                    existing.message = condition.message;
                } else {
                    *existing = condition;
                }
            }
            None => self.status.conditions.push(condition),
        }
    }

    /// Check if this workload currently holds an admission
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        self.condition_true(ConditionType::Admitted)
    }

    /// Check if this workload is being evicted
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.condition_true(ConditionType::Evicted)
    }

    /// Check if this workload has run to completion
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.condition_true(ConditionType::Finished)
    }

    /// Check if all pods of this workload have reached readiness
    #[must_use]
    pub fn pods_ready(&self) -> bool {
        self.condition_true(ConditionType::PodsReady)
    }

    /// The timestamp this workload is ordered by in its pending queue
    ///
    /// A workload evicted on PodsReady timeout re-queues by its eviction
    /// time which places it at the back of the line.
    #[must_use]
    pub fn queue_order_timestamp(&self) -> DateTime<Utc> {
        match self.condition(ConditionType::Evicted) {
            Some(cond) if cond.status && cond.reason == EVICTED_BY_PODS_READY_TIMEOUT => {
                cond.last_transition
            }
            _ => self.created,
        }
    }

    /// Apply an admission and raise the Admitted condition
    ///
    /// A stale Evicted condition from a prior admission is lowered.
    ///
    /// # Arguments
    ///
    /// * `admission` - The admission to apply
    pub fn set_admission(&mut self, admission: Admission) {
        let message = format!("Admitted by ClusterQueue {}", admission.cluster_queue);
        self.status.admission = Some(admission);
        self.set_condition(Condition::new(
            ConditionType::Admitted,
            true,
            "Admitted",
            message,
        ));
        // lower any Evicted condition left over from a prior admission
        if self.is_evicted() {
            let reason = self
                .condition(ConditionType::Evicted)
                .map(|cond| cond.reason.clone())
                .unwrap_or_default();
            self.set_condition(Condition::new(ConditionType::Evicted, false, reason, ""));
        }
    }

    /// Clear the admission and lower the Admitted condition
    ///
    /// # Arguments
    ///
    /// * `reason` - The machine readable reason admission was cleared
    /// * `message` - The human readable message to attach
    pub fn unset_admission<R: Into<String>, M: Into<String>>(&mut self, reason: R, message: M) {
        self.status.admission = None;
        self.set_condition(Condition::new(ConditionType::Admitted, false, reason, message));
    }
}

/// The totalled requests of a single pod set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodSetResources {
    /// The name of this pod set
    pub name: String,
    /// The pod count of this pod set
    pub count: u32,
    /// The total requests of this pod set scaled by its count
    pub requests: Requests,
    /// The flavor each resource was bound to once admitted
    pub flavors: HashMap<ResourceName, String>,
}

/// A workload along with the precomputed totals admission math runs on
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadInfo {
    /// The workload itself
    pub workload: Workload,
    /// The totalled requests of each pod set
    pub total_requests: Vec<PodSetResources>,
    /// The cluster queue this workload targets or was admitted into
    pub cluster_queue: String,
}

impl WorkloadInfo {
    /// Precompute the totals for a workload
    ///
    /// Once admitted the totals come from the admission record so usage is
    /// released exactly as it was charged.
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload to precompute totals for
    #[must_use]
    pub fn new(workload: Workload) -> Self {
        let (total_requests, cluster_queue) = match &workload.status.admission {
            Some(admission) => {
                let totals = admission
                    .pod_sets
                    .iter()
                    .map(|ps| {
                        // carry the pod count over from the matching pod set spec
                        let count = workload
                            .spec
                            .pod_sets
                            .iter()
                            .find(|spec| spec.name == ps.name)
                            .map(|spec| spec.count)
                            .unwrap_or_default();
                        PodSetResources {
                            name: ps.name.clone(),
                            count,
                            requests: ps.resource_usage.clone(),
                            flavors: ps.flavors.clone(),
                        }
                    })
                    .collect();
                (totals, admission.cluster_queue.clone())
            }
            None => {
                let totals = workload
                    .spec
                    .pod_sets
                    .iter()
                    .map(|ps| {
                        let mut requests = ps.template.total_requests();
                        requests.scale(i64::from(ps.count));
                        PodSetResources {
                            name: ps.name.clone(),
                            count: ps.count,
                            requests,
                            flavors: HashMap::default(),
                        }
                    })
                    .collect();
                (totals, String::new())
            }
        };
        WorkloadInfo {
            workload,
            total_requests,
            cluster_queue,
        }
    }

    /// Set the cluster queue this workload resolved to through its local queue
    ///
    /// # Arguments
    ///
    /// * `cluster_queue` - The cluster queue to set
    #[must_use]
    pub fn with_cluster_queue<T: Into<String>>(mut self, cluster_queue: T) -> Self {
        self.cluster_queue = cluster_queue.into();
        self
    }

    /// The namespace/name key for this workload
    #[must_use]
    pub fn key(&self) -> String {
        self.workload.key()
    }

    /// The usage this workload charges by flavor and resource once admitted
    #[must_use]
    pub fn usage(&self) -> Vec<(String, ResourceName, i64)> {
        let mut usage = Vec::default();
        for ps in &self.total_requests {
            for (resource, flavor) in &ps.flavors {
                usage.push((flavor.clone(), resource.clone(), ps.requests.get(resource)));
            }
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a bare workload for condition tests
    fn empty_workload() -> Workload {
        Workload {
            namespace: "unit".into(),
            name: "wl".into(),
            uid: Uuid::new_v4(),
            resource_version: 0,
            created: Utc::now(),
            spec: WorkloadSpec::default(),
            status: WorkloadStatus::default(),
        }
    }

    #[test]
    fn set_condition_only_bumps_transition_on_flip() {
        let mut workload = empty_workload();
        workload.set_condition(Condition::new(ConditionType::Admitted, true, "Admitted", "a"));
        let first = workload.condition(ConditionType::Admitted).unwrap().last_transition;
        // same status keeps the transition time but refreshes the message
        workload.set_condition(Condition::new(ConditionType::Admitted, true, "Admitted", "b"));
        let second = workload.condition(ConditionType::Admitted).unwrap();
        assert_eq!(second.last_transition, first);
        assert_eq!(second.message, "b");
        // a flip moves the transition time
        workload.set_condition(Condition::new(ConditionType::Admitted, false, "Evicted", ""));
        let third = workload.condition(ConditionType::Admitted).unwrap();
        assert!(third.last_transition >= first);
        assert!(!third.status);
    }

    #[test]
    fn queue_order_timestamp_tracks_pods_ready_eviction() {
        let mut workload = empty_workload();
        assert_eq!(workload.queue_order_timestamp(), workload.created);
        // a preemption eviction does not move the order timestamp
        workload.set_condition(Condition::new(
            ConditionType::Evicted,
            true,
            EVICTED_BY_PREEMPTION,
            "",
        ));
        assert_eq!(workload.queue_order_timestamp(), workload.created);
        // a pods ready timeout eviction orders by its transition time
        workload.status.conditions.clear();
        workload.set_condition(Condition::new(
            ConditionType::Evicted,
            true,
            EVICTED_BY_PODS_READY_TIMEOUT,
            "",
        ));
        let evicted = workload.condition(ConditionType::Evicted).unwrap().last_transition;
        assert_eq!(workload.queue_order_timestamp(), evicted);
    }

    #[test]
    fn totals_scale_by_pod_count() {
        let mut workload = empty_workload();
        workload.spec.pod_sets = vec![PodSet {
            name: "main".into(),
            count: 3,
            template: PodTemplate {
                containers: vec![Container {
                    name: "c".into(),
                    requests: [(ResourceName::Cpu, 500)].into_iter().collect(),
                }],
                overhead: [(ResourceName::Cpu, 100)].into_iter().collect(),
                ..PodTemplate::default()
            },
        }];
        let info = WorkloadInfo::new(workload);
        assert_eq!(info.total_requests[0].requests.get(&ResourceName::Cpu), 1800);
    }

    #[test]
    fn admitted_totals_come_from_the_admission_record() {
        let mut workload = empty_workload();
        workload.spec.pod_sets = vec![PodSet {
            name: "main".into(),
            count: 1,
            template: PodTemplate::default(),
        }];
        workload.set_admission(Admission {
            cluster_queue: "prod".into(),
            pod_sets: vec![PodSetAdmission {
                name: "main".into(),
                flavors: [(ResourceName::Cpu, "default".to_owned())].into_iter().collect(),
                resource_usage: [(ResourceName::Cpu, 2000)].into_iter().collect(),
            }],
        });
        let info = WorkloadInfo::new(workload);
        assert_eq!(info.cluster_queue, "prod");
        assert_eq!(info.usage(), vec![("default".to_owned(), ResourceName::Cpu, 2000)]);
    }
}
