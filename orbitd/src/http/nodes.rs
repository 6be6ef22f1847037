// Node-agent endpoints (spec §6.1): register, heartbeat, command
// acknowledge, command dequeue. These are the only endpoints a node
// calls rather than a user, so every one but `register` is HMAC-signed
// (spec §9 "Node trust boundary") instead of bearer-authenticated.

use crate::http::envelope::{ApiError, ApiResult, Data};
use orbit_base::DomainError;
use crate::http::extract::{extract_raw, verify_node_signature};
use crate::Server;
use axum::extract::{Path, State};
use orbit_base::ids::{CommandId, NodeId, VmId};
use orbit_base::model::{
    CgnatInfo, DhtInfo, HardwareInventory, Node, NodeLifecycle, PerformanceEvaluation,
    RelayInfo, ResourceCounters, VmStatus,
};
use orbit_net::CommandAck;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize)]
pub struct RegisterNodeRequest {
    pub wallet_address: String,
    pub public_ip: String,
    pub agent_port: u16,
    pub region: String,
    pub zone: Option<String>,
    pub hardware: HardwareInventory,
    pub performance: PerformanceEvaluation,
}

#[derive(Serialize)]
pub struct RegisterNodeResponse {
    pub node_id: NodeId,
}

/// Node bootstrap (spec §6.1). Unsigned: a node has no shared secret
/// until this call hands one out in practice (out of scope here, per
/// spec §1 — this accepts the node's self-reported identity directly,
/// same as the rest of the non-production auth surface).
pub async fn register_node(
    State(server): State<Server>,
    axum::Json(req): axum::Json<RegisterNodeRequest>,
) -> ApiResult<RegisterNodeResponse> {
    let total_resources = ResourceCounters {
        compute_points: (req.hardware.cores as u64) * 10 + req.hardware.memory_bytes / (1024 * 1024 * 1024),
        memory_bytes: req.hardware.memory_bytes,
        storage_bytes: req.hardware.disk_bytes,
    };
    let node = Node {
        id: NodeId::new(),
        wallet_address: req.wallet_address,
        public_ip: req.public_ip,
        agent_port: req.agent_port,
        region: req.region,
        zone: req.zone,
        hardware: req.hardware,
        performance: req.performance,
        total_resources,
        reserved_resources: ResourceCounters::default(),
        system_vm_obligations: Vec::new(),
        dht_info: DhtInfo::default(),
        relay_info: RelayInfo::default(),
        cgnat_info: CgnatInfo::default(),
        lifecycle: NodeLifecycle::Registering,
        last_heartbeat_at: None,
        reputation_uptime_percent: 100.0,
        reputation_success_rate: 1.0,
        price_per_point: 0.0,
        version: 0,
    };
    let node_id = node.id;
    server.store.put_node(node);
    tracing::info!(%node_id, "node registered");
    Ok(Data(RegisterNodeResponse { node_id }))
}

#[derive(Deserialize)]
pub struct VmStatusReport {
    pub vm_id: VmId,
    pub status: VmStatus,
    pub private_ip: Option<String>,
}

#[derive(Deserialize)]
pub struct NodeHeartbeat {
    pub reputation_uptime_percent: Option<f64>,
    pub reputation_success_rate: Option<f64>,
    #[serde(default)]
    pub vm_statuses: Vec<VmStatusReport>,
}

#[derive(Serialize)]
pub struct HeartbeatResponse {
    pub lifecycle: NodeLifecycle,
    pub commands: Vec<orbit_net::NodeCommand>,
}

/// Node heartbeat (spec §6.1, §4.3 "Channel model"): the node's
/// periodic proof of life, carrying VM status reports a handler would
/// otherwise have no other way to learn (spec §9 "fire-and-forget
/// stats updates" re-architecture — VM status itself is applied
/// directly here rather than deferred to an obligation, since it's
/// the node's own authoritative report, not a derived aggregate).
pub async fn heartbeat(
    State(server): State<Server>,
    Path(id): Path<String>,
    request: axum::extract::Request,
) -> ApiResult<HeartbeatResponse> {
    let node_id: NodeId = id.parse().map_err(|_| DomainError::Validation("malformed node id".into()))?;
    let raw = extract_raw(request).await?;
    verify_node_signature(&server, &raw.method, &raw.path, &raw.headers, &raw.body)?;
    let body: NodeHeartbeat = serde_json::from_slice(&raw.body)
        .map_err(|e| DomainError::Validation(format!("malformed heartbeat body: {e}")))?;

    let node = server
        .store
        .update_node(node_id, |node| {
            node.last_heartbeat_at = Some(chrono::Utc::now());
            node.lifecycle = NodeLifecycle::Online;
            if let Some(uptime) = body.reputation_uptime_percent {
                node.reputation_uptime_percent = uptime;
            }
            if let Some(success) = body.reputation_success_rate {
                node.reputation_success_rate = success;
            }
            Ok(())
        })
        .map_err(ApiError::from)?;

    for report in body.vm_statuses {
        let _ = server.store.update_vm(report.vm_id, |vm| {
            vm.status = report.status;
            if report.private_ip.is_some() {
                vm.network_config.private_ip = report.private_ip;
            }
            Ok(())
        });
    }

    let commands = server
        .channel
        .dequeue(node_id, Duration::from_millis(0))
        .await;
    for command in &commands {
        let _ = server.store.update_vm(command.target_resource_id, |vm| {
            vm.active_command_id = Some(command.command_id);
            vm.active_command_type = Some(format!("{:?}", command.kind));
            vm.active_command_issued_at = Some(chrono::Utc::now());
            Ok(())
        });
    }

    Ok(Data(HeartbeatResponse { lifecycle: node.lifecycle, commands }))
}

/// Command acknowledge (spec §4.3 "Pending-ack registry", §8 invariant
/// 5 "command ack exactly-once"). Applies the ack's effect on the VM
/// entity before firing the `commandAck:{cmdId}` signal, so a handler
/// woken by the signal always observes the post-ack state.
pub async fn acknowledge_command(
    State(server): State<Server>,
    Path((node_id, command_id)): Path<(String, String)>,
    request: axum::extract::Request,
) -> ApiResult<()> {
    let node_id: NodeId = node_id.parse().map_err(|_| DomainError::Validation("malformed node id".into()))?;
    let command_id: CommandId = command_id.parse().map_err(|_| DomainError::Validation("malformed command id".into()))?;
    let raw = extract_raw(request).await?;
    verify_node_signature(&server, &raw.method, &raw.path, &raw.headers, &raw.body)?;
    let ack: CommandAck = serde_json::from_slice(&raw.body)
        .map_err(|e| DomainError::Validation(format!("malformed ack body: {e}")))?;
    if ack.command_id != command_id {
        return Err(DomainError::Validation("command id mismatch between path and body".into()).into());
    }

    let pending = server
        .store
        .all_vms()
        .into_iter()
        .find(|vm| vm.active_command_id == Some(command_id) && vm.node_id == Some(node_id));
    if let Some(vm) = pending {
        let _ = server.store.update_vm(vm.id, |vm| {
            if ack.success {
                apply_ack_effect(vm);
            } else {
                vm.status = orbit_base::model::VmStatus::Error;
                vm.status_message = ack.error_message.clone();
            }
            vm.active_command_id = None;
            vm.active_command_type = None;
            vm.active_command_issued_at = None;
            Ok(())
        });
    }

    match server.channel.ack(ack) {
        Some(_) => Ok(Data(())),
        None => Err(DomainError::NotFound("command not pending or already acked".into()).into()),
    }
}

fn apply_ack_effect(vm: &mut orbit_base::model::VirtualMachine) {
    use orbit_base::model::{PowerState, VmStatus};
    match vm.active_command_type.as_deref() {
        Some("CreateVm") => {
            vm.status = VmStatus::Running;
            vm.power_state = PowerState::On;
        }
        // `vm.delete` stays `Deleting`: the handler is the one place
        // that releases the node reservation, so it finalizes the
        // terminal `Deleted` status itself once woken by this ack.
        Some("DeleteVm") => {}
        Some("StartVm") | Some("ResumeVm") => {
            vm.status = VmStatus::Running;
            vm.power_state = PowerState::On;
        }
        Some("StopVm") => {
            vm.status = VmStatus::Stopped;
            vm.power_state = PowerState::Off;
        }
        Some("PauseVm") => {
            vm.status = VmStatus::Paused;
            vm.power_state = PowerState::Paused;
        }
        Some("RestartVm") => {
            vm.status = VmStatus::Running;
            vm.power_state = PowerState::On;
        }
        _ => {}
    }
    vm.status_message = None;
}

#[derive(Serialize)]
pub struct DequeueResponse {
    pub commands: Vec<orbit_net::NodeCommand>,
}

/// Long-poll dequeue (spec §4.3 "Channel model": up to 30s wait).
pub async fn dequeue_commands(
    State(server): State<Server>,
    Path(id): Path<String>,
    request: axum::extract::Request,
) -> ApiResult<DequeueResponse> {
    let node_id: NodeId = id.parse().map_err(|_| DomainError::Validation("malformed node id".into()))?;
    let raw = extract_raw(request).await?;
    verify_node_signature(&server, &raw.method, &raw.path, &raw.headers, &raw.body)?;

    let commands = server.channel.dequeue(node_id, orbit_net::channel::DEFAULT_LONG_POLL_WAIT).await;
    for command in &commands {
        let _ = server.store.update_vm(command.target_resource_id, |vm| {
            vm.active_command_id = Some(command.command_id);
            vm.active_command_type = Some(format!("{:?}", command.kind));
            vm.active_command_issued_at = Some(chrono::Utc::now());
            Ok(())
        });
    }
    Ok(Data(DequeueResponse { commands }))
}
