// Dependency-graph resolution over the active obligation set (spec §4.1
// "Graph resolution"). Kahn's algorithm: obligations whose every
// dependency is absent (assumed completed-and-pruned) or `Completed`
// are ready; anything left over once no more nodes can be peeled off is
// a cycle participant.

use orbit_base::ids::ObligationId;
use orbit_base::model::{Obligation, ObligationStatus};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub struct GraphResolution {
    /// Ready obligations, ordered by descending priority then by id for
    /// determinism (spec §4.1: "ties broken by priority, higher first").
    pub ready: Vec<ObligationId>,
    /// Active obligations that sit in a dependency cycle and must be
    /// failed with reason `"cycle"`.
    pub cycle_participants: BTreeSet<ObligationId>,
}

/// Resolve the active set into a ready queue and cycle participants.
///
/// `active` must contain only non-terminal obligations (callers filter
/// the full active set before calling this).
pub fn resolve(active: &[Obligation]) -> GraphResolution {
    let by_id: BTreeMap<ObligationId, &Obligation> = active.iter().map(|o| (o.id, o)).collect();

    // in_degree counts dependencies that are both present in the active
    // set and not yet `Completed` — those are the only edges that block
    // readiness (an absent dependency is assumed completed-and-pruned).
    let mut in_degree: BTreeMap<ObligationId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<ObligationId, Vec<ObligationId>> = BTreeMap::new();

    for o in active {
        let blocking = o
            .depends_on
            .iter()
            .filter(|dep_id| {
                by_id
                    .get(dep_id)
                    .map(|dep| dep.status != ObligationStatus::Completed)
                    .unwrap_or(false)
            })
            .count();
        in_degree.insert(o.id, blocking);
        for dep_id in &o.depends_on {
            if by_id.contains_key(dep_id) {
                dependents.entry(*dep_id).or_default().push(o.id);
            }
        }
    }

    let mut queue: VecDeque<ObligationId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut ready = Vec::new();
    let mut visited: BTreeSet<ObligationId> = BTreeSet::new();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let obligation = by_id[&id];
        if is_dispatchable(obligation) {
            ready.push(id);
        }
        if let Some(children) = dependents.get(&id) {
            for child_id in children {
                if let Some(deg) = in_degree.get_mut(child_id) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(*child_id);
                    }
                }
            }
        }
    }

    let cycle_participants: BTreeSet<ObligationId> = by_id
        .keys()
        .filter(|id| !visited.contains(id))
        .copied()
        .collect();

    ready.sort_by(|a, b| {
        let oa = by_id[a];
        let ob = by_id[b];
        ob.priority.cmp(&oa.priority).then_with(|| a.cmp(b))
    });

    GraphResolution {
        ready,
        cycle_participants,
    }
}

/// An obligation whose dependencies have cleared is only actually
/// dispatchable if its own status says so — `WaitingForSignal` stays
/// parked regardless of graph position, and `Pending` must first become
/// `Ready` by a separate status transition (the dispatch loop does
/// that once dependencies are known clear).
fn is_dispatchable(o: &Obligation) -> bool {
    matches!(o.status, ObligationStatus::Ready | ObligationStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_base::model::CascadePolicy;

    fn sample(id: ObligationId, depends_on: Vec<ObligationId>, priority: i32) -> Obligation {
        Obligation {
            id,
            kind: "vm.schedule".into(),
            resource_type: "vm".into(),
            resource_id: "r".into(),
            priority,
            deadline: None,
            status: ObligationStatus::Ready,
            depends_on,
            data: Default::default(),
            failure_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            waiting_for_signal: None,
            wait_expiry: None,
            parent_id: None,
            children_ids: Vec::new(),
            last_error: None,
            cascade_policy: CascadePolicy::CancelDependents,
            completed_at: None,
            max_retries: Some(10),
        }
    }

    #[test]
    fn independent_obligations_are_all_ready() {
        let a = sample(ObligationId::new(), vec![], 0);
        let b = sample(ObligationId::new(), vec![], 0);
        let resolution = resolve(&[a.clone(), b.clone()]);
        assert_eq!(resolution.ready.len(), 2);
        assert!(resolution.cycle_participants.is_empty());
    }

    #[test]
    fn dependent_blocks_until_dependency_completed() {
        let parent = sample(ObligationId::new(), vec![], 0);
        let mut child = sample(ObligationId::new(), vec![parent.id], 0);
        let resolution = resolve(&[parent.clone(), child.clone()]);
        assert_eq!(resolution.ready, vec![parent.id]);

        child.depends_on = vec![parent.id];
        let mut completed_parent = parent.clone();
        completed_parent.status = ObligationStatus::Completed;
        let resolution = resolve(&[completed_parent, child.clone()]);
        assert_eq!(resolution.ready, vec![child.id]);
    }

    #[test]
    fn higher_priority_sorts_first() {
        let low = sample(ObligationId::new(), vec![], 0);
        let high = sample(ObligationId::new(), vec![], 10);
        let resolution = resolve(&[low.clone(), high.clone()]);
        assert_eq!(resolution.ready[0], high.id);
    }

    #[test]
    fn cycle_participants_are_never_dispatched() {
        let a_id = ObligationId::new();
        let b_id = ObligationId::new();
        let a = sample(a_id, vec![b_id], 0);
        let b = sample(b_id, vec![a_id], 0);
        let resolution = resolve(&[a, b]);
        assert!(resolution.ready.is_empty());
        assert_eq!(resolution.cycle_participants.len(), 2);
    }

    #[test]
    fn waiting_for_signal_is_never_ready_even_with_clear_deps() {
        let mut waiting = sample(ObligationId::new(), vec![], 0);
        waiting.status = ObligationStatus::WaitingForSignal;
        let resolution = resolve(&[waiting.clone()]);
        assert!(resolution.ready.is_empty());
        assert!(resolution.cycle_participants.is_empty());
    }
}
