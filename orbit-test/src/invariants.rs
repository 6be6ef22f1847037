// Pure checks for the quantified invariants in spec §8, usable both as
// plain assertions inside a scenario test and as the property under a
// `proptest!` generator. Kept independent of `TestHarness` so they can
// run over hand-built fixtures too.

use orbit_base::model::{Node, Obligation, ObligationStatus, VirtualMachine, VmStatus};
use std::collections::{BTreeMap, HashSet};

/// Invariant 1: a node's reserved compute points equal the sum of
/// `computePointCost` over VMs scheduled on it that aren't `Deleted`.
pub fn node_reservation_matches_vms(node: &Node, vms: &[VirtualMachine]) -> bool {
    let expected: u64 = vms
        .iter()
        .filter(|vm| vm.node_id == Some(node.id) && vm.status != VmStatus::Deleted)
        .map(|vm| vm.spec.compute_point_cost)
        .sum();
    node.reserved_resources.compute_points == expected
}

/// Invariant 2: `nodeShareMicros + platformFeeMicros == totalCostMicros`
/// exactly, and the fee is the floor of `totalCostMicros * bps / 10000`
/// (the only way to keep both the sum exact and the ratio well-defined
/// for fixed-point micros that don't divide evenly by 10000).
pub fn usage_split_is_exact(total_cost_micros: i64, node_share_micros: i64, platform_fee_micros: i64, platform_fee_bps: u32) -> bool {
    if node_share_micros + platform_fee_micros != total_cost_micros {
        return false;
    }
    let expected_fee = total_cost_micros * platform_fee_bps as i64 / 10_000;
    platform_fee_micros == expected_fee
}

/// Invariant 3: a `Completed` obligation's dependencies are all either
/// `Completed` or no longer present (pruned).
pub fn completed_dependencies_are_resolved(obligation: &Obligation, by_id: &BTreeMap<orbit_base::ids::ObligationId, Obligation>) -> bool {
    if obligation.status != ObligationStatus::Completed {
        return true;
    }
    obligation.depends_on.iter().all(|dep_id| match by_id.get(dep_id) {
        Some(dep) => dep.status == ObligationStatus::Completed,
        None => true,
    })
}

/// Kinds the spec calls out as "multi-instance safe": distinct `data`
/// keys on the obligation (e.g. `containerPort`) make concurrent active
/// obligations of the same `(type, resourceId)` expected rather than a
/// violation of invariant 6.
fn is_multi_instance_safe(kind: &str) -> bool {
    kind == "vm.allocate-ports"
}

/// Invariant 6: at most one active obligation per `(type, resourceId)`,
/// except multi-instance-safe kinds where distinct `data` must hold
/// instead.
pub fn at_most_one_active_per_resource(obligations: &[Obligation]) -> bool {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut seen_with_data: HashSet<(String, String, Vec<(String, String)>)> = HashSet::new();
    for ob in obligations.iter().filter(|o| o.is_active()) {
        let key = (ob.kind.clone(), ob.resource_id.clone());
        if is_multi_instance_safe(&ob.kind) {
            let data: Vec<(String, String)> = ob.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let data_key = (ob.kind.clone(), ob.resource_id.clone(), data);
            if !seen_with_data.insert(data_key) {
                return false;
            }
        } else if !seen.insert(key) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{NodeBuilder, ObligationBuilder, VmBuilder};
    use orbit_base::ids::UserId;
    use proptest::prelude::*;

    #[test]
    fn node_reservation_matches_a_single_scheduled_vm() {
        let node = NodeBuilder::new().build();
        let vm = VmBuilder::new(UserId::new())
            .node_id(Some(node.id))
            .compute_point_cost(20)
            .build();
        let mut node = node;
        node.reserved_resources.compute_points = 20;
        assert!(node_reservation_matches_vms(&node, &[vm]));
    }

    #[test]
    fn deleted_vms_dont_count_toward_reservation() {
        let node = NodeBuilder::new().build();
        let vm = VmBuilder::new(UserId::new())
            .node_id(Some(node.id))
            .compute_point_cost(20)
            .status(VmStatus::Deleted)
            .build();
        assert!(node_reservation_matches_vms(&node, &[vm]));
    }

    #[test]
    fn allocate_ports_with_distinct_ports_is_not_a_violation() {
        let a = ObligationBuilder::new("vm.allocate-ports", "vm", "v1")
            .data("containerPort", "80")
            .build();
        let b = ObligationBuilder::new("vm.allocate-ports", "vm", "v1")
            .data("containerPort", "443")
            .build();
        assert!(at_most_one_active_per_resource(&[a, b]));
    }

    #[test]
    fn two_active_schedule_obligations_for_same_vm_is_a_violation() {
        let a = ObligationBuilder::new("vm.schedule", "vm", "v1").build();
        let b = ObligationBuilder::new("vm.schedule", "vm", "v1").build();
        assert!(!at_most_one_active_per_resource(&[a, b]));
    }

    proptest! {
        #[test]
        fn usage_split_holds_for_any_cost_and_fee(
            total_cost_micros in 0i64..1_000_000_000,
            platform_fee_bps in 0u32..=10_000,
        ) {
            let platform_fee_micros = total_cost_micros * platform_fee_bps as i64 / 10_000;
            let node_share_micros = total_cost_micros - platform_fee_micros;
            prop_assert!(usage_split_is_exact(total_cost_micros, node_share_micros, platform_fee_micros, platform_fee_bps));
        }

        #[test]
        fn node_reservation_matches_any_set_of_scheduled_vms(
            costs in proptest::collection::vec(0u64..64, 0..10),
        ) {
            let node = NodeBuilder::new().build();
            let vms: Vec<VirtualMachine> = costs
                .iter()
                .map(|cost| VmBuilder::new(UserId::new()).node_id(Some(node.id)).compute_point_cost(*cost).build())
                .collect();
            let mut node = node;
            node.reserved_resources.compute_points = costs.iter().sum();
            prop_assert!(node_reservation_matches_vms(&node, &vms));
        }
    }
}
