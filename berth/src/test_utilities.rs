//! Fluent builders for the objects Berth tests create over and over

use chrono::prelude::*;
use uuid::Uuid;

use crate::models::{
    ClusterQueue, Container, FlavorQuotas, LabelSelector, LocalQueue, NodeSelectorTerm, PodSet,
    PodTemplate, PreemptionPolicy, QueueingStrategy, ResourceFlavor, ResourceGroup, ResourceName,
    ResourceQuota, Taint, Toleration, Workload, WorkloadSpec, WorkloadStatus,
};

/// A fluent builder for workloads
pub struct WorkloadBuilder {
    /// The workload being built
    workload: Workload,
}

impl WorkloadBuilder {
    /// Start building a workload with a single one pod set of one pod
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace this workload lives in
    /// * `name` - The name of this workload
    pub fn new<N: Into<String>, T: Into<String>>(namespace: N, name: T) -> Self {
        let workload = Workload {
            namespace: namespace.into(),
            name: name.into(),
            uid: Uuid::new_v4(),
            resource_version: 0,
            created: Utc::now(),
            spec: WorkloadSpec {
                pod_sets: vec![PodSet {
                    name: "main".into(),
                    count: 1,
                    template: PodTemplate {
                        containers: vec![Container::default()],
                        ..PodTemplate::default()
                    },
                }],
                queue_name: String::new(),
                priority: 0,
                priority_class_name: None,
            },
            status: WorkloadStatus::default(),
        };
        WorkloadBuilder { workload }
    }

    /// Set the local queue this workload is submitted to
    ///
    /// # Arguments
    ///
    /// * `queue` - The name of the local queue
    #[must_use]
    pub fn queue<T: Into<String>>(mut self, queue: T) -> Self {
        self.workload.spec.queue_name = queue.into();
        self
    }

    /// Set this workloads priority
    ///
    /// # Arguments
    ///
    /// * `priority` - The priority to set
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.workload.spec.priority = priority;
        self
    }

    /// Set this workloads creation timestamp
    ///
    /// # Arguments
    ///
    /// * `created` - The creation timestamp to set
    #[must_use]
    pub fn created(mut self, created: DateTime<Utc>) -> Self {
        self.workload.created = created;
        self
    }

    /// Add a request to the first container of the first pod set
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to request
    /// * `quantity` - The quantity to request in the resources integer unit
    #[must_use]
    pub fn request(mut self, resource: ResourceName, quantity: i64) -> Self {
        self.workload.spec.pod_sets[0].template.containers[0]
            .requests
            .set(resource, quantity);
        self
    }

    /// Replace the pod sets of this workload
    ///
    /// # Arguments
    ///
    /// * `pod_sets` - The pod sets to set
    #[must_use]
    pub fn pod_sets(mut self, pod_sets: Vec<PodSet>) -> Self {
        self.workload.spec.pod_sets = pod_sets;
        self
    }

    /// Require a node label on the first pod sets template
    ///
    /// # Arguments
    ///
    /// * `key` - The label key to require
    /// * `value` - The label value to require
    #[must_use]
    pub fn node_selector<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.workload.spec.pod_sets[0]
            .template
            .node_selector
            .insert(key.into(), value.into());
        self
    }

    /// Add a required node affinity term to the first pod sets template
    ///
    /// # Arguments
    ///
    /// * `term` - The term to add
    #[must_use]
    pub fn affinity(mut self, term: NodeSelectorTerm) -> Self {
        self.workload.spec.pod_sets[0]
            .template
            .required_affinity
            .push(term);
        self
    }

    /// Add a toleration to the first pod sets template
    ///
    /// # Arguments
    ///
    /// * `toleration` - The toleration to add
    #[must_use]
    pub fn toleration(mut self, toleration: Toleration) -> Self {
        self.workload.spec.pod_sets[0]
            .template
            .tolerations
            .push(toleration);
        self
    }

    /// Finish building this workload
    #[must_use]
    pub fn build(self) -> Workload {
        self.workload
    }
}

/// A fluent builder for pod sets
pub struct PodSetBuilder {
    /// The pod set being built
    pod_set: PodSet,
}

impl PodSetBuilder {
    /// Start building a pod set with a single container
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this pod set
    /// * `count` - The number of pods in this pod set
    pub fn new<T: Into<String>>(name: T, count: u32) -> Self {
        let pod_set = PodSet {
            name: name.into(),
            count,
            template: PodTemplate {
                containers: vec![Container::default()],
                ..PodTemplate::default()
            },
        };
        PodSetBuilder { pod_set }
    }

    /// Add a request to this pod sets container
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to request
    /// * `quantity` - The quantity a single pod requests
    #[must_use]
    pub fn request(mut self, resource: ResourceName, quantity: i64) -> Self {
        self.pod_set.template.containers[0].requests.set(resource, quantity);
        self
    }

    /// Require a node label on this pod sets template
    ///
    /// # Arguments
    ///
    /// * `key` - The label key to require
    /// * `value` - The label value to require
    #[must_use]
    pub fn node_selector<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.pod_set.template.node_selector.insert(key.into(), value.into());
        self
    }

    /// Add a toleration to this pod sets template
    ///
    /// # Arguments
    ///
    /// * `toleration` - The toleration to add
    #[must_use]
    pub fn toleration(mut self, toleration: Toleration) -> Self {
        self.pod_set.template.tolerations.push(toleration);
        self
    }

    /// Finish building this pod set
    #[must_use]
    pub fn build(self) -> PodSet {
        self.pod_set
    }
}

/// A fluent builder for the quotas a cluster queue holds in one flavor
pub struct FlavorQuotasBuilder {
    /// The quotas being built
    quotas: FlavorQuotas,
}

impl FlavorQuotasBuilder {
    /// Start building quotas for a flavor
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the flavor
    pub fn new<T: Into<String>>(name: T) -> Self {
        FlavorQuotasBuilder {
            quotas: FlavorQuotas {
                name: name.into(),
                resources: Vec::default(),
            },
        }
    }

    /// Add a nominal quota for a resource
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to add quota for
    /// * `nominal` - The guaranteed quantity
    #[must_use]
    pub fn resource(mut self, resource: ResourceName, nominal: i64) -> Self {
        self.quotas.resources.push(ResourceQuota {
            name: resource,
            nominal,
            borrowing_limit: None,
        });
        self
    }

    /// Add a quota with a borrowing limit for a resource
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource to add quota for
    /// * `nominal` - The guaranteed quantity
    /// * `limit` - The most this queue may borrow beyond nominal
    #[must_use]
    pub fn resource_with_limit(mut self, resource: ResourceName, nominal: i64, limit: i64) -> Self {
        self.quotas.resources.push(ResourceQuota {
            name: resource,
            nominal,
            borrowing_limit: Some(limit),
        });
        self
    }

    /// Finish building these quotas
    #[must_use]
    pub fn build(self) -> FlavorQuotas {
        self.quotas
    }
}

/// A fluent builder for cluster queues
pub struct ClusterQueueBuilder {
    /// The cluster queue being built
    queue: ClusterQueue,
}

impl ClusterQueueBuilder {
    /// Start building a cluster queue with no resource groups
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this cluster queue
    pub fn new<T: Into<String>>(name: T) -> Self {
        ClusterQueueBuilder {
            queue: ClusterQueue {
                name: name.into(),
                cohort: None,
                queueing_strategy: QueueingStrategy::default(),
                namespace_selector: None,
                resource_groups: Vec::default(),
                preemption: PreemptionPolicy::default(),
            },
        }
    }

    /// Place this queue in a cohort
    ///
    /// # Arguments
    ///
    /// * `cohort` - The cohort to join
    #[must_use]
    pub fn cohort<T: Into<String>>(mut self, cohort: T) -> Self {
        self.queue.cohort = Some(cohort.into());
        self
    }

    /// Set this queues queueing strategy
    ///
    /// # Arguments
    ///
    /// * `strategy` - The strategy to set
    #[must_use]
    pub fn strategy(mut self, strategy: QueueingStrategy) -> Self {
        self.queue.queueing_strategy = strategy;
        self
    }

    /// Set this queues preemption policy
    ///
    /// # Arguments
    ///
    /// * `preemption` - The policy to set
    #[must_use]
    pub fn preemption(mut self, preemption: PreemptionPolicy) -> Self {
        self.queue.preemption = preemption;
        self
    }

    /// Restrict the namespaces allowed to submit to this queue
    ///
    /// # Arguments
    ///
    /// * `selector` - The selector namespaces must match
    #[must_use]
    pub fn namespace_selector(mut self, selector: LabelSelector) -> Self {
        self.queue.namespace_selector = Some(selector);
        self
    }

    /// Add a resource group covering the union of its flavors resources
    ///
    /// # Arguments
    ///
    /// * `flavors` - The flavor quotas in this group in preference order
    #[must_use]
    pub fn resource_group(mut self, flavors: Vec<FlavorQuotas>) -> Self {
        // derive the covered set from the first flavors quotas
        let covered = flavors
            .first()
            .map(|quotas| quotas.resources.iter().map(|q| q.name.clone()).collect())
            .unwrap_or_default();
        self.queue.resource_groups.push(ResourceGroup {
            covered_resources: covered,
            flavors,
        });
        self
    }

    /// Finish building this cluster queue
    #[must_use]
    pub fn build(self) -> ClusterQueue {
        self.queue
    }
}

/// A fluent builder for resource flavors
pub struct ResourceFlavorBuilder {
    /// The flavor being built
    flavor: ResourceFlavor,
}

impl ResourceFlavorBuilder {
    /// Start building a resource flavor
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this flavor
    pub fn new<T: Into<String>>(name: T) -> Self {
        ResourceFlavorBuilder {
            flavor: ResourceFlavor::new(name),
        }
    }

    /// Add a node label to this flavor
    ///
    /// # Arguments
    ///
    /// * `key` - The label key to add
    /// * `value` - The label value to add
    #[must_use]
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.flavor.node_labels.insert(key.into(), value.into());
        self
    }

    /// Add a node taint to this flavor
    ///
    /// # Arguments
    ///
    /// * `taint` - The taint to add
    #[must_use]
    pub fn taint(mut self, taint: Taint) -> Self {
        self.flavor.node_taints.push(taint);
        self
    }

    /// Finish building this flavor
    #[must_use]
    pub fn build(self) -> ResourceFlavor {
        self.flavor
    }
}

/// Build a local queue binding a namespace to a cluster queue
///
/// # Arguments
///
/// * `namespace` - The namespace this local queue lives in
/// * `name` - The name of this local queue
/// * `cluster_queue` - The cluster queue this local queue feeds
pub fn local_queue<N, T, C>(namespace: N, name: T, cluster_queue: C) -> LocalQueue
where
    N: Into<String>,
    T: Into<String>,
    C: Into<String>,
{
    LocalQueue {
        namespace: namespace.into(),
        name: name.into(),
        cluster_queue: cluster_queue.into(),
    }
}
