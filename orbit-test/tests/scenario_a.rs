// Spec §8 Scenario A — happy-path VM create, end to end through the
// real handler chain: schedule -> provision -> (simulated agent ack)
// -> register-ingress, converging on invariant 1.

use orbit_base::ids::UserId;
use orbit_base::model::{NodeLifecycle, ObligationStatus, VmStatus};
use orbit_net::{CommandAck, CommandType};
use orbit_test::{invariants, NodeBuilder, ObligationBuilder, TestHarness, VmBuilder};

#[tokio::test]
async fn happy_path_vm_create_converges_to_running_with_ingress() {
    let harness = TestHarness::new();

    let node = NodeBuilder::new()
        .lifecycle(NodeLifecycle::Online)
        .total_points(100)
        .build();
    let node_id = harness.put_node(node);

    // Default spec is 2 vCPU / Standard tier -> `vmPointCost` = 4 (spec
    // §4.2's `pointsPerVCpu` pricing, not the advisory `computePointCost`
    // field the HTTP layer stamps at creation time).
    let owner = UserId::new();
    let vm = VmBuilder::new(owner).build();
    let vm_id = harness.put_vm(vm);
    {
        // A subdomain is what makes `vm.register-ingress` fire once
        // provisioning lands (spec §6.1 create-vm request carries one).
        let mut vm = harness.store.get_vm(vm_id).unwrap();
        vm.ingress_config.subdomain = Some("my-app".into());
        harness.store.put_vm(vm);
    }
    harness.put_obligation(
        ObligationBuilder::new("vm.schedule", "vm", vm_id.to_string())
            .max_retries(None)
            .build(),
    );

    // (1)+(2): scheduled onto the node, reserving 20 points.
    let scheduled = harness
        .run_until(10, |store| store.get_vm(vm_id).map(|v| v.node_id.is_some()).unwrap_or(false))
        .await;
    assert!(scheduled, "vm never got scheduled onto a node");
    assert_eq!(harness.store.get_node(node_id).unwrap().reserved_resources.compute_points, 4);

    // (3): vm.provision sends CreateVm and the vm moves to Provisioning.
    let provisioning = harness
        .run_until(10, |store| store.get_vm(vm_id).map(|v| v.active_command_id.is_some()).unwrap_or(false))
        .await;
    assert!(provisioning, "vm.provision never sent a create-vm command");
    let vm = harness.store.get_vm(vm_id).unwrap();
    assert_eq!(vm.status, VmStatus::Provisioning);
    let command_id = vm.active_command_id.expect("active command recorded");

    // Simulate the node agent: apply the effect an HTTP acknowledge
    // would (spec §6.1 acknowledge endpoint), then fire the ack itself.
    harness
        .store
        .update_vm(vm_id, |v| {
            v.status = VmStatus::Running;
            v.network_config.private_ip = Some("10.1.2.3".into());
            v.active_command_id = None;
            v.active_command_type = None;
            v.active_command_issued_at = None;
            Ok(())
        })
        .unwrap();
    assert_eq!(
        harness.channel.ack(CommandAck {
            command_id,
            success: true,
            error_message: None,
            result_data: None,
        }),
        Some(true)
    );

    // (4)+(5): provisioning resolves and register-ingress completes.
    let converged = harness
        .run_until(10, |store| {
            store
                .all_obligations()
                .iter()
                .any(|o| o.kind == "vm.register-ingress" && o.status == ObligationStatus::Completed)
        })
        .await;
    assert!(converged, "vm.register-ingress never completed");

    let vm = harness.store.get_vm(vm_id).unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.node_id, Some(node_id));

    // (6): invariant 1 holds at quiescence.
    let node = harness.store.get_node(node_id).unwrap();
    let vms = harness.store.all_vms();
    assert!(invariants::node_reservation_matches_vms(&node, &vms));
}
