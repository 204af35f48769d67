//! Assigns a flavor to every resource a workload requests
//!
//! For each pod set the assigner walks the quota groups covering its
//! requests and picks a single flavor per group that satisfies every
//! covered resource at once, considering taints, node affinity, the queues
//! own quota, and quota borrowed from its cohort. The outcome for each
//! flavor is classified as Fit, Preempt, or NoFit.

use std::cmp::max;
use std::collections::HashMap;

use berth::models::{
    flavors, format_quantity, Admission, FlavorResourceQuantities, NodeSelectorTerm,
    PodSetAdmission, PodTemplate, Requests, ResourceFlavor, ResourceName, ResourceQuota,
    WorkloadInfo,
};
use berth::Error;
use tracing::{event, Level};

use super::cache::{charge, charged, CohortSnapshot, QuotaGroup, SnapshotQueue};

/// How a flavor can satisfy a resource request
///
/// The modes are ordered from least to most preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssignmentMode {
    /// There is not enough quota to assign this flavor
    NoFit,
    /// Preempting workloads in the queue or cohort could free enough quota
    Preempt,
    /// There is enough unused quota to assign this flavor now
    Fit,
}

impl AssignmentMode {
    /// Get our mode as a str
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            AssignmentMode::NoFit => "NoFit",
            AssignmentMode::Preempt => "Preempt",
            AssignmentMode::Fit => "Fit",
        }
    }
}

/// The flavor assigned to a single resource
#[derive(Debug, Clone, PartialEq)]
pub struct FlavorAssignment {
    /// The name of the assigned flavor
    pub name: String,
    /// How this flavor satisfies the request
    pub mode: AssignmentMode,
    /// The quantity borrowed from the cohort for this resource
    pub borrow: i64,
}

/// The flavors assigned to each resource of a pod set
pub type ResourceAssignment = HashMap<ResourceName, FlavorAssignment>;

/// The reasons a pod set could not be assigned immediately
#[derive(Debug, Default)]
pub struct Status {
    /// The human readable reasons collected while trying flavors
    reasons: Vec<String>,
    /// A hard error that blocks the workload until its spec is corrected
    error: Option<Error>,
}

impl Status {
    /// Check if this status carries a hard error
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Add a reason to this status
    ///
    /// # Arguments
    ///
    /// * `reason` - The reason to add
    fn append(&mut self, reason: String) {
        self.reasons.push(reason);
    }

    /// Render this status as a single sorted message
    #[must_use]
    pub fn message(&self) -> String {
        if let Some(error) = &self.error {
            return error.msg();
        }
        let mut reasons = self.reasons.clone();
        reasons.sort();
        reasons.join(", ")
    }
}

/// The assignment computed for a single pod set
///
/// Empty flavors mean NoFit for every resource; an empty status means Fit
/// for every resource. Both cannot be empty once fully calculated.
#[derive(Debug, Default)]
pub struct PodSetAssignment {
    /// The name of the pod set this assignment covers
    pub name: String,
    /// The flavor assigned to each requested resource
    pub flavors: ResourceAssignment,
    /// The reasons assignment could not complete immediately
    pub status: Option<Status>,
    /// The requests this assignment was computed for
    pub requests: Requests,
}

impl PodSetAssignment {
    /// The worst assignment mode among this pod sets resources
    #[must_use]
    pub fn representative_mode(&self) -> AssignmentMode {
        if self.status.is_none() {
            return AssignmentMode::Fit;
        }
        if self.flavors.is_empty() {
            return AssignmentMode::NoFit;
        }
        self.flavors
            .values()
            .map(|assignment| assignment.mode)
            .min()
            .unwrap_or(AssignmentMode::Fit)
    }

    /// Merge the flavors found for one resource group into this assignment
    ///
    /// # Arguments
    ///
    /// * `flavors` - The flavors to merge in
    /// * `status` - The reasons collected while finding them
    fn append(&mut self, found: ResourceAssignment, status: Status) {
        self.flavors.extend(found);
        if let Some(existing) = &mut self.status {
            existing.reasons.extend(status.reasons);
        } else if !status.reasons.is_empty() {
            self.status = Some(status);
        }
    }

    /// Cast this assignment to the admission record shape
    fn to_admission(&self) -> PodSetAdmission {
        let flavors = self
            .flavors
            .iter()
            .map(|(resource, assignment)| (resource.clone(), assignment.name.clone()))
            .collect();
        PodSetAdmission {
            name: self.name.clone(),
            flavors,
            resource_usage: self.requests.clone(),
        }
    }
}

/// The assignment computed for a whole workload
#[derive(Debug, Default)]
pub struct Assignment {
    /// The per pod set assignments
    pub pod_sets: Vec<PodSetAssignment>,
    /// The total quantity borrowed from the cohort by flavor and resource
    pub total_borrow: FlavorResourceQuantities,
    /// The usage accumulated as pod sets get flavors assigned
    usage: FlavorResourceQuantities,
}

impl Assignment {
    /// Check if this assignment borrows from the cohort
    #[must_use]
    pub fn borrows(&self) -> bool {
        !self.total_borrow.is_empty()
    }

    /// The worst assignment mode among all pod sets
    #[must_use]
    pub fn representative_mode(&self) -> AssignmentMode {
        if self.pod_sets.is_empty() {
            return AssignmentMode::NoFit;
        }
        self.pod_sets
            .iter()
            .map(PodSetAssignment::representative_mode)
            .min()
            .unwrap_or(AssignmentMode::Fit)
    }

    /// Render the reasons this assignment could not complete immediately
    #[must_use]
    pub fn message(&self) -> String {
        let mut parts = Vec::default();
        for ps in &self.pod_sets {
            let Some(status) = &ps.status else {
                continue;
            };
            if status.is_error() {
                return format!(
                    "failed to assign flavors to pod set {}: {}",
                    ps.name,
                    status.message()
                );
            }
            parts.push(format!(
                "couldn't assign flavors to pod set {}: {}",
                ps.name,
                status.message()
            ));
        }
        parts.join("; ")
    }

    /// Cast this assignment to an admission record
    ///
    /// # Arguments
    ///
    /// * `cluster_queue` - The queue this admission is into
    #[must_use]
    pub fn to_admission(&self, cluster_queue: &str) -> Admission {
        Admission {
            cluster_queue: cluster_queue.to_owned(),
            pod_sets: self.pod_sets.iter().map(PodSetAssignment::to_admission).collect(),
        }
    }

    /// The usage this assignment would charge by flavor and resource
    #[must_use]
    pub fn usage(&self) -> &FlavorResourceQuantities {
        &self.usage
    }

    /// Track a pod sets assignment and accumulate its borrowing and usage
    ///
    /// # Arguments
    ///
    /// * `requests` - The requests the pod set was assigned for
    /// * `ps_assignment` - The pod sets assignment
    fn append(&mut self, requests: &Requests, ps_assignment: PodSetAssignment) {
        for (resource, assignment) in &ps_assignment.flavors {
            if assignment.borrow > 0 {
                // the returned borrow already considers earlier pod sets so
                // overwrite rather than accumulate
                self.total_borrow
                    .entry(assignment.name.clone())
                    .or_default()
                    .insert(resource.clone(), assignment.borrow);
            }
            charge(&mut self.usage, &assignment.name, resource, requests.get(resource));
        }
        self.pod_sets.push(ps_assignment);
    }
}

/// Assign flavors to each resource requested by each pod set of a workload
///
/// The result for each pod set is accompanied by the reasons the flavors
/// could not be assigned immediately.
///
/// # Arguments
///
/// * `info` - The workload to assign flavors for
/// * `queue` - The snapshot of the queue the workload targets
/// * `cohort` - The snapshot of the queues cohort if it is in one
/// * `catalogue` - The flavor catalogue
#[must_use]
pub fn assign_flavors(
    info: &WorkloadInfo,
    queue: &SnapshotQueue,
    cohort: Option<&CohortSnapshot>,
    catalogue: &HashMap<String, ResourceFlavor>,
) -> Assignment {
    let mut assignment = Assignment::default();
    for (index, pod_set) in info.total_requests.iter().enumerate() {
        let mut requests = pod_set.requests.clone();
        // inject the pods pseudo resource when the queue holds quota for it
        if queue.covers_pods() {
            requests.set(ResourceName::Pods, i64::from(pod_set.count));
        }
        let mut ps_assignment = PodSetAssignment {
            name: pod_set.name.clone(),
            flavors: ResourceAssignment::default(),
            status: None,
            requests: requests.clone(),
        };
        let template = &info.workload.spec.pod_sets[index].template;
        for resource in requests.sorted_names() {
            // this resource may have been assigned together with its group
            if ps_assignment.flavors.contains_key(&resource) {
                continue;
            }
            let Some(group) = queue.group_for(&resource) else {
                let mut status = Status::default();
                status.append(format!("resource {resource} unavailable in ClusterQueue"));
                ps_assignment.flavors = ResourceAssignment::default();
                ps_assignment.status = Some(status);
                break;
            };
            let (found, status) =
                find_flavor_for_group(&assignment.usage, group, &requests, queue, cohort, catalogue, template);
            if status.is_error() || found.is_empty() {
                ps_assignment.flavors = ResourceAssignment::default();
                ps_assignment.status = Some(status);
                break;
            }
            ps_assignment.append(found, status);
        }
        let failed = ps_assignment.status.as_ref().is_some_and(Status::is_error)
            || (!requests.is_empty() && ps_assignment.flavors.is_empty());
        assignment.append(&requests, ps_assignment);
        if failed {
            // this assignment failed so borrowing no longer matters
            assignment.total_borrow = FlavorResourceQuantities::default();
            return assignment;
        }
    }
    assignment
}

/// Find the flavor in a group that can satisfy every covered request
///
/// Flavors are tried in declared order and the first Fit wins. When no
/// flavor fits the best mode found is kept along with every reason.
///
/// # Arguments
///
/// * `prior_usage` - Usage already committed by earlier pod sets
/// * `group` - The group to pick a flavor from
/// * `requests` - The pod sets requests
/// * `queue` - The snapshot of the queue being admitted into
/// * `cohort` - The snapshot of the queues cohort if it is in one
/// * `catalogue` - The flavor catalogue
/// * `template` - The pod template carrying selectors and tolerations
#[allow(clippy::too_many_arguments)]
fn find_flavor_for_group(
    prior_usage: &FlavorResourceQuantities,
    group: &QuotaGroup,
    requests: &Requests,
    queue: &SnapshotQueue,
    cohort: Option<&CohortSnapshot>,
    catalogue: &HashMap<String, ResourceFlavor>,
    template: &PodTemplate,
) -> (ResourceAssignment, Status) {
    let mut status = Status::default();
    let requests = requests.restrict(&group.covered);
    let mut best = ResourceAssignment::default();
    let mut best_mode = AssignmentMode::NoFit;
    // only the label keys present on this groups flavors matter here
    let selector = FlavorSelector::new(template, group);
    for quotas in &group.flavors {
        let Some(flavor) = catalogue.get(&quotas.name) else {
            event!(Level::ERROR, flavor = quotas.name, msg = "Flavor not found");
            status.append(format!("flavor {} not found", quotas.name));
            continue;
        };
        if let Some(taint) = flavors::find_untolerated_taint(&flavor.node_taints, &template.tolerations)
        {
            status.append(format!("untolerated taint {taint} in flavor {}", quotas.name));
            continue;
        }
        match selector.matches(&flavor.node_labels) {
            Ok(true) => (),
            Ok(false) => {
                status.append(format!("flavor {} doesn't match node affinity", quotas.name));
                continue;
            }
            Err(error) => {
                status.error = Some(error);
                return (ResourceAssignment::default(), status);
            }
        }
        let mut assignments = ResourceAssignment::default();
        // the flavors mode is the worst mode among all covered requests
        let mut representative = AssignmentMode::Fit;
        for resource in requests.sorted_names() {
            let value = requests.get(&resource);
            // account for usage this workloads earlier pod sets already took
            let value = value + charged(prior_usage, &quotas.name, &resource);
            let quota = group.quota(&quotas.name, &resource);
            let (mode, borrow, fit_status) =
                fits_resource_quota(&quotas.name, &resource, value, queue, cohort, quota);
            if let Some(fit_status) = fit_status {
                status.reasons.extend(fit_status.reasons);
            }
            representative = representative.min(mode);
            if representative == AssignmentMode::NoFit {
                // this flavor cannot work so skip its remaining resources
                break;
            }
            assignments.insert(
                resource,
                FlavorAssignment {
                    name: quotas.name.clone(),
                    mode,
                    borrow,
                },
            );
        }
        if representative > best_mode {
            best = assignments;
            best_mode = representative;
            if best_mode == AssignmentMode::Fit {
                // everything fits in the cohort so stop trying flavors
                return (best, Status::default());
            }
        }
    }
    (best, status)
}

/// Decide how a flavor could satisfy one resource request
///
/// Returns the assignment mode, the borrowing required on a Fit, and the
/// reasons when the request cannot be satisfied immediately.
///
/// # Arguments
///
/// * `flavor` - The name of the flavor being checked
/// * `resource` - The resource being checked
/// * `value` - The requested quantity including earlier pod sets usage
/// * `queue` - The snapshot of the queue being admitted into
/// * `cohort` - The snapshot of the queues cohort if it is in one
/// * `quota` - The queues quota for this resource in this flavor
fn fits_resource_quota(
    flavor: &str,
    resource: &ResourceName,
    value: i64,
    queue: &SnapshotQueue,
    cohort: Option<&CohortSnapshot>,
    quota: Option<&ResourceQuota>,
) -> (AssignmentMode, i64, Option<Status>) {
    let mut status = Status::default();
    let Some(quota) = quota else {
        status.append(format!("resource {resource} unavailable in flavor {flavor}"));
        return (AssignmentMode::NoFit, 0, Some(status));
    };
    let used = queue.usage_of(flavor, resource);
    let mut mode = AssignmentMode::NoFit;
    if value <= quota.nominal {
        // the nominal quota could cover this request once it is reclaimed
        // from the cohort or freed by preempting workloads in the queue
        mode = AssignmentMode::Preempt;
    }
    if let Some(limit) = quota.borrowing_limit {
        if used + value > quota.nominal + limit {
            status.append(format!("borrowing limit for {resource} in flavor {flavor} exceeded"));
            return (mode, 0, Some(status));
        }
    }
    // without a cohort the queues own numbers stand in for the cohorts
    let (cohort_used, cohort_available) = match cohort {
        Some(cohort) => (
            cohort.usage_of(flavor, resource),
            cohort.requestable_of(flavor, resource),
        ),
        None => (used, quota.nominal),
    };
    let lack = cohort_used + value - cohort_available;
    if lack <= 0 {
        let borrow = max(0, used + value - quota.nominal);
        return (AssignmentMode::Fit, borrow, None);
    }
    let lack_quantity = format_quantity(resource, lack);
    let msg = match (cohort, mode) {
        (None, AssignmentMode::NoFit) => {
            format!("insufficient quota for {resource} in flavor {flavor} in ClusterQueue")
        }
        (None, _) => format!(
            "insufficient unused quota for {resource} in flavor {flavor}, {lack_quantity} more needed"
        ),
        (Some(_), _) => format!(
            "insufficient unused quota in cohort for {resource} in flavor {flavor}, {lack_quantity} more needed"
        ),
    };
    status.append(msg);
    (mode, 0, Some(status))
}

/// The filtered selector a pod set is matched against flavor labels with
///
/// Only the label keys that appear on the groups flavors are kept; other
/// keys are orthogonal constraints the orchestrator applies later. If an
/// affinity term becomes empty after filtering it matches any flavor since
/// terms are ORed.
struct FlavorSelector {
    /// The filtered exact match node selector
    node_selector: HashMap<String, String>,
    /// The filtered required affinity terms
    terms: Vec<NodeSelectorTerm>,
}

impl FlavorSelector {
    /// Build the filtered selector for a pod template against a group
    ///
    /// # Arguments
    ///
    /// * `template` - The pod template carrying the selectors
    /// * `group` - The group whose label keys are relevant
    fn new(template: &PodTemplate, group: &QuotaGroup) -> Self {
        let node_selector = template
            .node_selector
            .iter()
            .filter(|(key, _)| group.label_keys.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let mut terms = Vec::default();
        for term in &template.required_affinity {
            let filtered = term
                .match_expressions
                .iter()
                .filter(|req| group.label_keys.contains(&req.key))
                .cloned()
                .collect::<Vec<_>>();
            // an empty term matches any flavor and terms are ORed, so the
            // affinity gate reduces to the node selector alone
            if filtered.is_empty() {
                terms = Vec::default();
                break;
            }
            terms.push(NodeSelectorTerm {
                match_expressions: filtered,
            });
        }
        FlavorSelector {
            node_selector,
            terms,
        }
    }

    /// Check whether a flavors labels satisfy this selector
    ///
    /// # Arguments
    ///
    /// * `labels` - The flavors node labels
    fn matches(&self, labels: &HashMap<String, String>) -> Result<bool, Error> {
        for (key, value) in &self.node_selector {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
        if self.terms.is_empty() {
            return Ok(true);
        }
        for term in &self.terms {
            if term.matches(labels)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
