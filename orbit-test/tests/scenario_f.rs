// Spec §8 Scenario F — orchestrator crashes after enqueueing `DeleteVm`
// but before receiving the ack. On restart, the pending-ack registry
// (in-memory, not persisted) is empty, but the obligation's signal wait
// has already expired in the store, so it re-enters `Ready` and the
// handler notices the command isn't tracked anymore and re-sends.

use orbit_base::ids::{CommandId, UserId};
use orbit_base::model::{ObligationStatus, VmStatus};
use orbit_base::store::shared_store;
use orbit_net::CommandAck;
use orbit_test::{builders::ObligationBuilder, NodeBuilder, TestHarness, VmBuilder};

#[tokio::test]
async fn delete_ack_race_survives_a_restart() {
    let store = shared_store();

    let node = NodeBuilder::new().total_points(100).reserved_points(4).build();
    let node_id = node.id;
    store.put_node(node);

    let owner = UserId::new();
    let stale_command_id = CommandId::new();
    let vm = VmBuilder::new(owner)
        .node_id(Some(node_id))
        .status(VmStatus::Deleting)
        .build();
    let vm_id = vm.id;
    let mut vm = vm;
    vm.active_command_id = Some(stale_command_id);
    vm.active_command_type = Some("DeleteVm".into());
    store.put_vm(vm);

    // The obligation was `WaitingForSignal` when the process died; its
    // wait has already expired by the time we "restart" below, which is
    // what lets the engine re-ready it without any live signal.
    let mut obligation = ObligationBuilder::new("vm.delete", "vm", vm_id.to_string())
        .max_retries(None)
        .status(ObligationStatus::WaitingForSignal)
        .build();
    obligation.waiting_for_signal = Some(orbit_net::NodeCommand::signal_key(stale_command_id));
    obligation.wait_expiry = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    store.put_obligation(obligation);

    // "Restart": fresh signal bus, fresh node command channel, same
    // persisted store.
    let harness = TestHarness::with_store(store);

    let resent = harness
        .run_until(10, |store| {
            store
                .get_vm(vm_id)
                .map(|v| v.active_command_id.is_some() && v.active_command_id != Some(stale_command_id))
                .unwrap_or(false)
        })
        .await;
    assert!(resent, "handler never noticed the stale command and re-sent delete-vm");

    let vm = harness.store.get_vm(vm_id).unwrap();
    assert_eq!(vm.status, VmStatus::Deleting);
    let fresh_command_id = vm.active_command_id.unwrap();

    // The node "re-connects" and acks the re-sent command.
    harness
        .store
        .update_vm(vm_id, |v| {
            v.active_command_id = None;
            v.active_command_type = None;
            v.active_command_issued_at = None;
            Ok(())
        })
        .unwrap();
    assert_eq!(
        harness.channel.ack(CommandAck {
            command_id: fresh_command_id,
            success: true,
            error_message: None,
            result_data: None,
        }),
        Some(true)
    );

    let finalized = harness
        .run_until(10, |store| store.get_vm(vm_id).map(|v| v.status == VmStatus::Deleted).unwrap_or(false))
        .await;
    assert!(finalized, "vm.delete never finalized after the re-sent command was acked");

    let node = harness.store.get_node(node_id).unwrap();
    assert_eq!(node.reserved_resources.compute_points, 0, "reservation must be released on finalize");
}
