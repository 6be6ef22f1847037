// VM lifecycle endpoints (spec §6.1): create, fetch, act on, delete.
// Each mutating endpoint only ever enqueues an obligation or flips a
// state-gated field; the obligation engine owns the actual lifecycle
// transitions (spec §4).

use crate::http::envelope::{ApiError, ApiResult, Data};
use orbit_base::DomainError;
use crate::http::extract::AuthPrincipal;
use crate::Server;
use axum::extract::{Path, State};
use axum::Json;
use orbit_base::ids::VmId;
use orbit_base::model::{
    AccessInfo, BillingInfo, DirectAccess, IngressConfig, NetworkConfig, PowerState, QualityTier,
    VirtualMachine, VmSpec, VmStatus, VmType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub virtual_cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub quality_tier: QualityTier,
    pub ssh_public_key: Option<String>,
    pub user_data: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub requires_public_ip: bool,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default)]
    pub subdomain: Option<String>,
}

#[derive(Serialize)]
pub struct VmView {
    pub id: VmId,
    pub name: String,
    pub vm_type: VmType,
    pub status: VmStatus,
    pub node_id: Option<orbit_base::ids::NodeId>,
    pub public_hostname: Option<String>,
    pub private_ip: Option<String>,
}

/// Redacts everything but the public-facing subset of `VirtualMachine`
/// (spec §6.1 "redacted sensitive labels" — labels, ssh keys, and raw
/// billing numbers never leave this boundary).
impl From<VirtualMachine> for VmView {
    fn from(vm: VirtualMachine) -> Self {
        Self {
            id: vm.id,
            name: vm.name,
            vm_type: vm.vm_type,
            status: vm.status,
            node_id: vm.node_id,
            public_hostname: vm.access_info.public_hostname,
            private_ip: vm.network_config.private_ip,
        }
    }
}

fn compute_point_cost(cores: u32, memory_bytes: u64, tier: QualityTier) -> u64 {
    let base = (cores as u64) * 10 + memory_bytes / (1024 * 1024 * 1024);
    match tier {
        QualityTier::Burstable => base / 2,
        QualityTier::Standard => base,
        QualityTier::Premium => base * 2,
    }
}

pub async fn create_vm(
    State(server): State<Server>,
    AuthPrincipal(principal): AuthPrincipal,
    Json(req): Json<CreateVmRequest>,
) -> ApiResult<VmView> {
    if req.virtual_cpu_cores == 0 || req.memory_bytes == 0 || req.disk_bytes == 0 {
        return Err(DomainError::Validation("cpu/memory/disk must be non-zero".into()).into());
    }

    let spec = VmSpec {
        virtual_cpu_cores: req.virtual_cpu_cores,
        memory_bytes: req.memory_bytes,
        disk_bytes: req.disk_bytes,
        quality_tier: req.quality_tier,
        compute_point_cost: compute_point_cost(req.virtual_cpu_cores, req.memory_bytes, req.quality_tier),
        ssh_public_key: req.ssh_public_key,
        user_data: req.user_data,
        region: req.region,
        zone: req.zone,
        requires_public_ip: req.requires_public_ip,
        requires_gpu: req.requires_gpu,
    };

    let vm = VirtualMachine {
        id: VmId::new(),
        owner_id: principal.user_id,
        owner_wallet: principal.wallet_address,
        name: req.name,
        vm_type: VmType::User,
        spec,
        node_id: None,
        status: VmStatus::Pending,
        status_message: None,
        power_state: PowerState::Off,
        network_config: NetworkConfig::default(),
        access_info: AccessInfo::default(),
        ingress_config: IngressConfig {
            subdomain: req.subdomain,
            custom_domain: None,
        },
        direct_access: DirectAccess::default(),
        services: Vec::new(),
        labels: BTreeMap::new(),
        active_command_id: None,
        active_command_type: None,
        active_command_issued_at: None,
        billing_info: BillingInfo::default(),
        version: 0,
    };
    let vm_id = vm.id;
    server.store.put_vm(vm.clone());
    server.store.put_obligation(orbit_scheduler::new_vm_schedule_obligation(vm_id, 0));
    server.audit.record(principal.user_id, "vm.create", vm_id.to_string(), serde_json::json!({}));

    Ok(Data(vm.into()))
}

pub async fn get_vm(
    State(server): State<Server>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
) -> ApiResult<VmView> {
    let vm_id: VmId = id.parse().map_err(|_| DomainError::Validation("malformed vm id".into()))?;
    let vm = server.store.get_vm(vm_id).ok_or_else(|| DomainError::NotFound("vm not found".into()))?;
    if vm.owner_id != principal.user_id && !principal.is_admin() {
        return Err(DomainError::Forbidden("not your vm".into()).into());
    }
    Ok(Data(vm.into()))
}

#[derive(Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    Start,
    Stop,
    Restart,
    Pause,
    Resume,
}

#[derive(Deserialize)]
pub struct VmActionRequest {
    pub action: VmAction,
}

/// State-gated power actions (spec §6.1). These only validate the
/// current state and flip `power_state`/`status_message`; actually
/// reaching the node is the node-command channel's job, driven by a
/// future obligation type out of this endpoint's scope (today's
/// lifecycle obligations cover create/delete/ingress/ports).
pub async fn vm_action(
    State(server): State<Server>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
    Json(req): Json<VmActionRequest>,
) -> ApiResult<VmView> {
    let vm_id: VmId = id.parse().map_err(|_| DomainError::Validation("malformed vm id".into()))?;
    let vm = server.store.get_vm(vm_id).ok_or_else(|| DomainError::NotFound("vm not found".into()))?;
    if vm.owner_id != principal.user_id && !principal.is_admin() {
        return Err(DomainError::Forbidden("not your vm".into()).into());
    }
    if !matches!(vm.status, VmStatus::Running | VmStatus::Stopped | VmStatus::Paused) {
        return Err(DomainError::Conflict(format!("vm is {:?}, cannot act on it now", vm.status)).into());
    }

    let kind = match req.action {
        VmAction::Start | VmAction::Resume if vm.status == VmStatus::Running => {
            return Err(DomainError::Conflict("vm already running".into()).into());
        }
        VmAction::Stop if vm.status != VmStatus::Running => {
            return Err(DomainError::Conflict("vm is not running".into()).into());
        }
        VmAction::Start => orbit_net::CommandType::StartVm,
        VmAction::Stop => orbit_net::CommandType::StopVm,
        VmAction::Restart => orbit_net::CommandType::RestartVm,
        VmAction::Pause => orbit_net::CommandType::PauseVm,
        VmAction::Resume => orbit_net::CommandType::ResumeVm,
    };

    let Some(node_id) = vm.node_id else {
        return Err(DomainError::Conflict("vm has no assigned node".into()).into());
    };
    server
        .channel
        .send(node_id, vm_id, kind, serde_json::json!({}), true)
        .await
        .map_err(ApiError::from)?;
    server.audit.record(principal.user_id, "vm.action", vm_id.to_string(), serde_json::json!({"action": req.action as u8}));

    Ok(Data(vm.into()))
}

pub async fn delete_vm(
    State(server): State<Server>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let vm_id: VmId = id.parse().map_err(|_| DomainError::Validation("malformed vm id".into()))?;
    let vm = server.store.get_vm(vm_id).ok_or_else(|| DomainError::NotFound("vm not found".into()))?;
    if vm.owner_id != principal.user_id && !principal.is_admin() {
        return Err(DomainError::Forbidden("not your vm".into()).into());
    }
    server.store.put_obligation(orbit_scheduler::new_vm_delete_obligation(vm_id, 0));
    server.audit.record(principal.user_id, "vm.delete", vm_id.to_string(), serde_json::json!({}));
    Ok(Data(()))
}
