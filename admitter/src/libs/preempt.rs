//! Plans which admitted workloads to evict so a preemptor can fit
//!
//! The planner works entirely against a scratch copy of the cycle snapshot.
//! It never issues evictions itself; the scheduler turns a returned plan
//! into eviction requests and retries the preemptor in a later cycle.

use std::collections::HashSet;

use berth::models::{PreemptionRule, ReclaimRule, ResourceName, WorkloadInfo};
use berth::models::ConditionType;
use tracing::{event, Level};

use super::assigner::{assign_flavors, Assignment, AssignmentMode};
use super::cache::Snapshot;

/// A candidate victim along with where it is admitted
#[derive(Debug, Clone)]
struct Candidate {
    /// The admitted workload that could be evicted
    info: WorkloadInfo,
    /// Whether this candidate comes from another cohort member
    from_cohort: bool,
}

/// Plan the victims whose eviction would let a workload fit
///
/// Returns None when policy forbids preemption or no set of allowed
/// victims frees enough quota.
///
/// # Arguments
///
/// * `info` - The workload that needs quota freed
/// * `assignment` - The Preempt mode assignment that was computed for it
/// * `snapshot` - The cycle snapshot to plan against
/// * `queue_name` - The queue the workload targets
#[must_use]
pub fn plan(
    info: &WorkloadInfo,
    assignment: &Assignment,
    snapshot: &Snapshot,
    queue_name: &str,
) -> Option<Vec<WorkloadInfo>> {
    let queue = snapshot.cluster_queues.get(queue_name)?;
    let policy = queue.preemption;
    if policy.within_cluster_queue == PreemptionRule::Never
        && policy.reclaim_within_cohort == ReclaimRule::Never
    {
        return None;
    }
    // the flavor/resource pairs the preemptor is blocked on
    let contested = contested_pairs(assignment);
    if contested.is_empty() {
        return None;
    }
    let mut candidates = Vec::default();
    // lower priority workloads in the target queue itself
    if policy.within_cluster_queue == PreemptionRule::LowerPriority {
        for victim in queue.workloads.values() {
            if victim.workload.spec.priority < info.workload.spec.priority
                && eligible(victim, &contested)
            {
                candidates.push(Candidate {
                    info: victim.clone(),
                    from_cohort: false,
                });
            }
        }
    }
    // borrowers in other cohort members holding contested capacity
    if policy.reclaim_within_cohort != ReclaimRule::Never {
        if let Some(cohort) = &queue.cohort {
            for member in snapshot.cluster_queues.values() {
                if member.name == queue.name || member.cohort.as_ref() != Some(cohort) {
                    continue;
                }
                // only members borrowing on a contested pair can be reclaimed from
                let borrowing = contested.iter().any(|(flavor, resource)| {
                    let nominal = member
                        .group_for(resource)
                        .and_then(|group| group.quota(flavor, resource))
                        .map(|quota| quota.nominal)
                        .unwrap_or_default();
                    member.usage_of(flavor, resource) > nominal
                });
                if !borrowing {
                    continue;
                }
                for victim in member.workloads.values() {
                    let allowed = match policy.reclaim_within_cohort {
                        ReclaimRule::Any => true,
                        ReclaimRule::LowerPriority => {
                            victim.workload.spec.priority < info.workload.spec.priority
                        }
                        ReclaimRule::Never => false,
                    };
                    if allowed && eligible(victim, &contested) {
                        candidates.push(Candidate {
                            info: victim.clone(),
                            from_cohort: true,
                        });
                    }
                }
            }
        }
    }
    if candidates.is_empty() {
        return None;
    }
    // prefer reclaiming from cohort borrowers, then lower priorities, then
    // the most recently admitted
    candidates.sort_by(|a, b| {
        b.from_cohort
            .cmp(&a.from_cohort)
            .then_with(|| a.info.workload.spec.priority.cmp(&b.info.workload.spec.priority))
            .then_with(|| admitted_at(&b.info).cmp(&admitted_at(&a.info)))
    });
    // greedily evict candidates on a scratch snapshot until the target fits
    let mut scratch = snapshot.clone();
    let mut victims = Vec::with_capacity(1);
    for candidate in candidates {
        scratch.remove_workload(&candidate.info.cluster_queue, &candidate.info.key());
        victims.push(candidate.info);
        let queue = scratch.cluster_queues.get(queue_name)?;
        let retry = assign_flavors(info, queue, scratch.cohort_of(queue), &scratch.flavors);
        if retry.representative_mode() == AssignmentMode::Fit {
            event!(
                Level::INFO,
                workload = info.key(),
                victims = victims.len(),
                msg = "Planned preemption",
            );
            return Some(victims);
        }
    }
    None
}

/// The flavor/resource pairs an assignment is blocked on
///
/// # Arguments
///
/// * `assignment` - The assignment to read Preempt pairs from
fn contested_pairs(assignment: &Assignment) -> HashSet<(String, ResourceName)> {
    let mut contested = HashSet::default();
    for ps in &assignment.pod_sets {
        for (resource, flavor) in &ps.flavors {
            if flavor.mode == AssignmentMode::Preempt {
                contested.insert((flavor.name.clone(), resource.clone()));
            }
        }
    }
    contested
}

/// Check whether a workload may be evicted to free contested capacity
///
/// Workloads already mid eviction are skipped so they are never evicted
/// twice, and victims must actually hold usage on a contested pair.
///
/// # Arguments
///
/// * `victim` - The candidate victim
/// * `contested` - The contested flavor/resource pairs
fn eligible(victim: &WorkloadInfo, contested: &HashSet<(String, ResourceName)>) -> bool {
    if victim.workload.is_evicted() {
        return false;
    }
    victim
        .usage()
        .iter()
        .any(|(flavor, resource, _)| contested.contains(&(flavor.clone(), resource.clone())))
}

/// When a workload was admitted
///
/// # Arguments
///
/// * `info` - The workload to read the admission time from
fn admitted_at(info: &WorkloadInfo) -> chrono::DateTime<chrono::Utc> {
    info.workload
        .condition(ConditionType::Admitted)
        .map(|cond| cond.last_transition)
        .unwrap_or(info.workload.created)
}
