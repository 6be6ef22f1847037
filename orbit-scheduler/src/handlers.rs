// VM lifecycle obligation handlers (spec §4.2, §2 "Obligation Handlers").
// Each handler is idempotent per spec §4.1: re-running against a VM
// whose work already landed returns `Completed` without re-issuing
// commands.

use crate::scoring::{pick_node, vm_point_cost, ScoringWeights};
use async_trait::async_trait;
use orbit_adapt::{IngressConfigApplier, IngressRoute};
use orbit_base::error::err;
use orbit_base::ids::{ObligationId, VmId};
use orbit_base::model::{CascadePolicy, NodeLifecycle, Obligation, ObligationStatus, VmStatus};
use orbit_base::store::SharedStore;
use orbit_engine::{Handler, HandlerOutcome};
use orbit_net::{CommandType, NodeCommandChannel};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const ACK_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub(crate) fn child_obligation(kind: &str, resource_type: &str, resource_id: String, priority: i32) -> Obligation {
    Obligation {
        id: ObligationId::new(),
        kind: kind.into(),
        resource_type: resource_type.into(),
        resource_id,
        priority,
        deadline: None,
        status: ObligationStatus::Ready,
        depends_on: Vec::new(),
        data: BTreeMap::new(),
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

fn target_vm(obligation: &Obligation) -> Result<VmId, HandlerOutcome> {
    obligation
        .resource_id
        .parse::<VmId>()
        .map_err(|_| HandlerOutcome::fail(format!("malformed vm id {}", obligation.resource_id)))
}

/// Spawn a `vm.schedule` child for a newly-created VM — used by the
/// system-VM controller when it mints a fresh infrastructure VM.
pub(crate) fn schedule_child(vm_id: VmId, priority: i32) -> Obligation {
    child_obligation("vm.schedule", "vm", vm_id.to_string(), priority)
}

/// Spawn a `vm.delete` child — used by the system-VM controller's
/// self-heal and failed-retry steps to release a VM before redeploy.
pub(crate) fn delete_child(vm_id: VmId, priority: i32) -> Obligation {
    child_obligation("vm.delete", "vm", vm_id.to_string(), priority)
}

/// Root `vm.schedule` obligation for a VM a user just created.
pub fn new_vm_schedule_obligation(vm_id: VmId, priority: i32) -> Obligation {
    schedule_child(vm_id, priority)
}

/// Root `vm.delete` obligation for a VM a user asked to tear down.
pub fn new_vm_delete_obligation(vm_id: VmId, priority: i32) -> Obligation {
    delete_child(vm_id, priority)
}

/// `vm.schedule` — select a node and reserve resources (spec §4.2).
/// Retries with no cap until the VM's `deadline` passes, per the
/// obligation's own `max_retries: None`; this handler is the one place
/// that turns "no suitable node" into a terminal `Fail` once the
/// deadline is reached.
pub struct VmScheduleHandler {
    store: SharedStore,
    weights: ScoringWeights,
}

impl VmScheduleHandler {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            weights: ScoringWeights::default(),
        }
    }
}

#[async_trait]
impl Handler for VmScheduleHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.schedule"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm no longer exists");
        };
        if vm.status.is_terminal_deleted() {
            return HandlerOutcome::completed("vm deleted before scheduling");
        }
        if vm.node_id.is_some() {
            return HandlerOutcome::completed("already scheduled");
        }

        let nodes = self.store.all_nodes();
        let Some(node) = pick_node(&nodes, &vm.spec, vm.vm_type, &self.weights) else {
            if let Some(deadline) = obligation.deadline {
                if chrono::Utc::now() > deadline {
                    return HandlerOutcome::fail("no suitable node available before deadline");
                }
            }
            return HandlerOutcome::retry("no suitable node available");
        };

        let node_id = node.id;
        let cost = vm_point_cost(&vm.spec, vm.vm_type);
        let reserved = self.store.update_node(node_id, |n| {
            let available = n.available();
            if available.compute_points < cost
                || available.memory_bytes < vm.spec.memory_bytes
                || available.storage_bytes < vm.spec.disk_bytes
            {
                return Err(err("node capacity changed before reservation could land"));
            }
            n.reserved_resources.compute_points += cost;
            n.reserved_resources.memory_bytes += vm.spec.memory_bytes;
            n.reserved_resources.storage_bytes += vm.spec.disk_bytes;
            Ok(())
        });
        if reserved.is_err() {
            return HandlerOutcome::retry("lost the race to reserve on the chosen node");
        }

        if self
            .store
            .update_vm(vm_id, |v| {
                v.node_id = Some(node_id);
                v.status = VmStatus::Provisioning;
                Ok(())
            })
            .is_err()
        {
            return HandlerOutcome::retry("vm disappeared after node reservation");
        }

        tracing::info!(vm_id = %vm_id, node_id = %node_id, points = cost, "vm scheduled");
        let child = child_obligation("vm.provision", "vm", vm_id.to_string(), obligation.priority);
        HandlerOutcome::CompletedWithChildren {
            children: vec![child],
            message: format!("scheduled on node {node_id}"),
        }
    }
}

/// `vm.provision` — send the node agent a `CreateVm` command and wait
/// for its ack. The ack itself (processed outside this handler, at the
/// HTTP acknowledge endpoint) is what actually flips the VM to
/// `Running`; this handler only notices that it already happened.
pub struct VmProvisionHandler {
    store: SharedStore,
    channel: Arc<NodeCommandChannel>,
}

impl VmProvisionHandler {
    pub fn new(store: SharedStore, channel: Arc<NodeCommandChannel>) -> Self {
        Self { store, channel }
    }
}

#[async_trait]
impl Handler for VmProvisionHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.provision"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm no longer exists");
        };
        if matches!(vm.status, VmStatus::Running | VmStatus::Error) {
            // The ack already landed. Fan out the post-provision steps
            // (spec §8 Scenario A) exactly once, here at the handler's
            // own terminal transition.
            let mut children = Vec::new();
            if vm.ingress_config.subdomain.is_some() {
                children.push(child_obligation("vm.register-ingress", "vm", vm_id.to_string(), obligation.priority));
            }
            return HandlerOutcome::CompletedWithChildren {
                children,
                message: "provisioning already resolved".into(),
            };
        }
        let Some(node_id) = vm.node_id else {
            return HandlerOutcome::retry("vm has no assigned node yet");
        };

        if let Some(node) = self.store.get_node(node_id) {
            if node.lifecycle == NodeLifecycle::Offline {
                let child = child_obligation("vm.reschedule", "vm", vm_id.to_string(), obligation.priority);
                return HandlerOutcome::CompletedWithChildren {
                    children: vec![child],
                    message: format!("node {node_id} went offline mid-provision"),
                };
            }
        }

        if let Some(command_id) = vm.active_command_id {
            if self.channel.pending(command_id).is_some() {
                return HandlerOutcome::wait_for_signal(
                    orbit_net::NodeCommand::signal_key(command_id),
                    "awaiting create-vm acknowledgment",
                    ACK_WAIT_TIMEOUT,
                );
            }
            // The in-memory pending-ack registry no longer knows this
            // command (expired in a prior tick, or lost across a
            // restart per spec §8 Scenario F); the VM is still not
            // `Running`, so re-send.
        }

        let payload = serde_json::json!({
            "vmId": vm_id.to_string(),
            "spec": {
                "virtualCpuCores": vm.spec.virtual_cpu_cores,
                "memoryBytes": vm.spec.memory_bytes,
                "diskBytes": vm.spec.disk_bytes,
                "sshPublicKey": vm.spec.ssh_public_key,
                "userData": vm.spec.user_data,
            },
        });
        let command_id = match self
            .channel
            .send(node_id, vm_id, CommandType::CreateVm, payload, true)
            .await
        {
            Ok(id) => id,
            Err(e) => return HandlerOutcome::retry(format!("failed to enqueue create-vm: {e}")),
        };
        if self
            .store
            .update_vm(vm_id, |v| {
                v.active_command_id = Some(command_id);
                v.active_command_type = Some("CreateVm".into());
                v.active_command_issued_at = Some(chrono::Utc::now());
                Ok(())
            })
            .is_err()
        {
            return HandlerOutcome::retry("vm disappeared while recording active command");
        }
        HandlerOutcome::wait_for_signal(
            orbit_net::NodeCommand::signal_key(command_id),
            "awaiting create-vm acknowledgment",
            ACK_WAIT_TIMEOUT,
        )
    }
}

/// `vm.reschedule` — undo a stranded scheduling decision (spec §8
/// Scenario C: node went Offline mid-provision) and re-enter the
/// scheduler from scratch.
pub struct VmRescheduleHandler {
    store: SharedStore,
}

impl VmRescheduleHandler {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for VmRescheduleHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.reschedule"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm no longer exists");
        };
        if vm.status.is_terminal_deleted() {
            return HandlerOutcome::completed("vm deleted before reschedule");
        }
        if vm.node_id.is_none() {
            return HandlerOutcome::completed("already released");
        }

        if let Some(node_id) = vm.node_id {
            let _ = self.store.update_node(node_id, |n| {
                let cost = vm_point_cost(&vm.spec, vm.vm_type);
                n.reserved_resources.compute_points = n.reserved_resources.compute_points.saturating_sub(cost);
                n.reserved_resources.memory_bytes =
                    n.reserved_resources.memory_bytes.saturating_sub(vm.spec.memory_bytes);
                n.reserved_resources.storage_bytes =
                    n.reserved_resources.storage_bytes.saturating_sub(vm.spec.disk_bytes);
                Ok(())
            });
        }

        if self
            .store
            .update_vm(vm_id, |v| {
                v.node_id = None;
                v.status = VmStatus::Pending;
                v.status_message = Some("rescheduled after node went offline".into());
                v.active_command_id = None;
                v.active_command_type = None;
                v.active_command_issued_at = None;
                Ok(())
            })
            .is_err()
        {
            return HandlerOutcome::retry("vm disappeared while releasing stranded reservation");
        }

        tracing::info!(vm_id = %vm_id, "released stranded reservation, rescheduling");
        let child = schedule_child(vm_id, obligation.priority);
        HandlerOutcome::CompletedWithChildren {
            children: vec![child],
            message: "released stranded reservation".into(),
        }
    }
}

/// `vm.delete` — tear the VM down on its node and release the node's
/// reservation once gone. Resource release is folded directly into
/// this handler's completion step rather than a separate "compensate"
/// obligation type, since no such type is named among the spec's
/// handlers.
pub struct VmDeleteHandler {
    store: SharedStore,
    channel: Arc<NodeCommandChannel>,
}

impl VmDeleteHandler {
    pub fn new(store: SharedStore, channel: Arc<NodeCommandChannel>) -> Self {
        Self { store, channel }
    }

    fn release_reservation(&self, vm_id: VmId, node_id: orbit_base::ids::NodeId) {
        if let Some(vm) = self.store.get_vm(vm_id) {
            let _ = self.store.update_node(node_id, |n| {
                n.reserved_resources.compute_points =
                    n.reserved_resources.compute_points.saturating_sub(vm_point_cost(&vm.spec, vm.vm_type));
                n.reserved_resources.memory_bytes =
                    n.reserved_resources.memory_bytes.saturating_sub(vm.spec.memory_bytes);
                n.reserved_resources.storage_bytes =
                    n.reserved_resources.storage_bytes.saturating_sub(vm.spec.disk_bytes);
                Ok(())
            });
        }
    }
}

#[async_trait]
impl Handler for VmDeleteHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.delete"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm already gone");
        };
        if vm.status.is_terminal_deleted() {
            return HandlerOutcome::completed("already deleted");
        }
        let Some(node_id) = vm.node_id else {
            // Never scheduled: nothing to tear down remotely.
            if self
                .store
                .update_vm(vm_id, |v| {
                    v.status = VmStatus::Deleted;
                    Ok(())
                })
                .is_ok()
            {
                return HandlerOutcome::completed("deleted unscheduled vm");
            }
            return HandlerOutcome::retry("failed to mark unscheduled vm deleted");
        };

        if let Some(command_id) = vm.active_command_id {
            if self.channel.pending(command_id).is_some() {
                return HandlerOutcome::wait_for_signal(
                    orbit_net::NodeCommand::signal_key(command_id),
                    "awaiting delete-vm acknowledgment",
                    ACK_WAIT_TIMEOUT,
                );
            }
            // Not tracked anymore (expired earlier, or the registry
            // was lost across a restart per spec §8 Scenario F) and
            // the VM never reached a terminal state, so re-send.
        } else if vm.status == VmStatus::Deleting {
            // The ack handler clears `activeCommandId` on success but
            // leaves `status=Deleting` for this handler to finalize,
            // so it is always the one place that releases the
            // reservation (spec §8 invariant 1).
            self.release_reservation(vm_id, node_id);
            return match self.store.update_vm(vm_id, |v| {
                v.status = VmStatus::Deleted;
                Ok(())
            }) {
                Ok(_) => HandlerOutcome::completed("deleted and released reservation"),
                Err(_) => HandlerOutcome::retry("vm disappeared while finalizing delete"),
            };
        }

        let command_id = match self
            .channel
            .send(node_id, vm_id, CommandType::DeleteVm, serde_json::json!({}), true)
            .await
        {
            Ok(id) => id,
            Err(e) => return HandlerOutcome::retry(format!("failed to enqueue delete-vm: {e}")),
        };
        if self
            .store
            .update_vm(vm_id, |v| {
                v.status = VmStatus::Deleting;
                v.active_command_id = Some(command_id);
                v.active_command_type = Some("DeleteVm".into());
                v.active_command_issued_at = Some(chrono::Utc::now());
                Ok(())
            })
            .is_err()
        {
            return HandlerOutcome::retry("vm disappeared while recording delete command");
        }
        HandlerOutcome::wait_for_signal(
            orbit_net::NodeCommand::signal_key(command_id),
            "awaiting delete-vm acknowledgment",
            ACK_WAIT_TIMEOUT,
        )
    }
}

/// `vm.register-ingress` — upload the VM's desired route to the
/// ingress applier (idempotent full-config model, spec §6).
pub struct VmRegisterIngressHandler {
    store: SharedStore,
    applier: Arc<dyn IngressConfigApplier>,
}

impl VmRegisterIngressHandler {
    pub fn new(store: SharedStore, applier: Arc<dyn IngressConfigApplier>) -> Self {
        Self { store, applier }
    }
}

#[async_trait]
impl Handler for VmRegisterIngressHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.register-ingress"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm no longer exists");
        };
        let Some(subdomain) = vm.ingress_config.subdomain.clone() else {
            return HandlerOutcome::fail("vm has no subdomain to register");
        };
        let Some(private_ip) = vm.network_config.private_ip.clone() else {
            return HandlerOutcome::retry("vm has no private ip yet");
        };

        let all_routes: Vec<IngressRoute> = self
            .store
            .all_vms()
            .into_iter()
            .filter_map(|v| {
                v.ingress_config.subdomain.clone().zip(v.network_config.private_ip.clone()).map(
                    |(subdomain, private_ip)| IngressRoute {
                        subdomain,
                        target_private_ip: private_ip,
                        target_port: 80,
                    },
                )
            })
            .chain(std::iter::once(IngressRoute {
                subdomain,
                target_private_ip: private_ip,
                target_port: 80,
            }))
            .collect();

        match self.applier.apply_routes(&all_routes).await {
            Ok(()) => HandlerOutcome::completed("ingress route applied"),
            Err(e) => HandlerOutcome::retry(format!("ingress apply failed: {e}")),
        }
    }
}

/// `vm.allocate-ports` — request direct-access port mappings from the
/// node agent.
pub struct VmAllocatePortsHandler {
    store: SharedStore,
    channel: Arc<NodeCommandChannel>,
}

impl VmAllocatePortsHandler {
    pub fn new(store: SharedStore, channel: Arc<NodeCommandChannel>) -> Self {
        Self { store, channel }
    }
}

#[async_trait]
impl Handler for VmAllocatePortsHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.allocate-ports"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm no longer exists");
        };
        let Some(node_id) = vm.node_id else {
            return HandlerOutcome::retry("vm has no assigned node yet");
        };
        let Some(requested_port) = obligation.data.get("containerPort").and_then(|p| p.parse::<u16>().ok())
        else {
            return HandlerOutcome::fail("allocate-ports obligation missing containerPort");
        };
        if vm.direct_access.port_mappings.contains_key(&requested_port) {
            return HandlerOutcome::completed("port already allocated");
        }

        // Multi-instance safe (spec §8): distinct `containerPort` in
        // `data` means concurrent allocate-ports obligations for the
        // same VM are expected and do not conflict with each other.
        let payload = serde_json::json!({ "containerPort": requested_port });
        match self
            .channel
            .send(node_id, vm_id, CommandType::AllocatePort, payload, true)
            .await
        {
            Ok(_) => HandlerOutcome::completed("port allocation requested"),
            Err(e) => HandlerOutcome::retry(format!("failed to enqueue allocate-port: {e}")),
        }
    }
}
