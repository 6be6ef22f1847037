// The entity model (spec §3). Plain data, serializable with stable
// field names and `#[serde(default)]` on optional/added fields so old
// snapshots deserialize forward-compatibly (spec §6 "Persisted state").
// Entities carry a `version` counter for optimistic concurrency on
// read-modify-write (spec §5 "Shared-resource policy").

use crate::ids::{CommandId, CustomDomainId, NodeId, ObligationId, UserId, UsageRecordId, VmId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------- Node

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeLifecycle {
    Registering,
    Online,
    Offline,
    Decommissioned,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NatType {
    None,
    Cgnat,
    FullCone,
    Symmetric,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HardwareInventory {
    pub cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub bandwidth_mbps: Option<u32>,
    pub nat_type: Option<NatType>,
    pub has_gpu: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEvaluation {
    pub benchmark_score: u64,
    pub allowed_tiers: Vec<QualityTier>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceCounters {
    pub compute_points: u64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SystemVmRole {
    Relay,
    Dht,
    Ingress,
    BlockStore,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SystemVmStatus {
    Pending,
    Deploying,
    Active,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SystemVmObligation {
    pub role: SystemVmRole,
    pub vm_id: Option<VmId>,
    pub status: SystemVmStatus,
    pub failure_count: u32,
    pub deployed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub active_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    /// `getAdvertiseIp(node)` at the time this VM was deployed/adopted
    /// (spec §4.4 step 4). Compared against the node's current
    /// advertise IP on every self-heal pass so a CGNAT relay assigned
    /// after deployment triggers a redeploy.
    #[serde(default)]
    pub advertised_ip: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DhtInfo {
    pub dht_vm_id: Option<VmId>,
    pub bootstrap_peer_count: u32,
    pub peer_count_zero_since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_vm_id: Option<VmId>,
    pub status: Option<SystemVmStatus>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CgnatInfo {
    pub tunnel_ip: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub wallet_address: String,
    pub public_ip: String,
    pub agent_port: u16,
    pub region: String,
    #[serde(default)]
    pub zone: Option<String>,

    pub hardware: HardwareInventory,
    pub performance: PerformanceEvaluation,
    pub total_resources: ResourceCounters,
    pub reserved_resources: ResourceCounters,

    pub system_vm_obligations: Vec<SystemVmObligation>,
    pub dht_info: DhtInfo,
    pub relay_info: RelayInfo,
    pub cgnat_info: CgnatInfo,

    pub lifecycle: NodeLifecycle,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default)]
    pub reputation_uptime_percent: f64,
    #[serde(default)]
    pub reputation_success_rate: f64,
    #[serde(default)]
    pub price_per_point: f64,

    #[serde(default)]
    pub version: u64,
}

impl Node {
    pub fn available(&self) -> ResourceCounters {
        ResourceCounters {
            compute_points: self
                .total_resources
                .compute_points
                .saturating_sub(self.reserved_resources.compute_points),
            memory_bytes: self
                .total_resources
                .memory_bytes
                .saturating_sub(self.reserved_resources.memory_bytes),
            storage_bytes: self
                .total_resources
                .storage_bytes
                .saturating_sub(self.reserved_resources.storage_bytes),
        }
    }
}

// ---------------------------------------------------------- VirtualMachine

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum QualityTier {
    Burstable,
    Standard,
    Premium,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum VmType {
    User,
    Relay,
    Dht,
    BlockStore,
    Ingress,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum VmStatus {
    Pending,
    Scheduling,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Error,
    Paused,
}

impl VmStatus {
    pub fn is_terminal_deleted(&self) -> bool {
        matches!(self, VmStatus::Deleted)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
    Paused,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub virtual_cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub quality_tier: QualityTier,
    pub compute_point_cost: u64,
    pub ssh_public_key: Option<String>,
    pub user_data: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub requires_public_ip: bool,
    pub requires_gpu: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub private_ip: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccessInfo {
    pub public_hostname: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IngressConfig {
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirectAccess {
    pub port_mappings: BTreeMap<u16, u16>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BillingInfo {
    pub last_billing_at: Option<chrono::DateTime<chrono::Utc>>,
    pub hourly_rate_crypto: f64,
    pub total_billed: f64,
    pub total_runtime_secs: u64,
    pub verified_runtime_secs: u64,
    pub unverified_runtime_secs: u64,
    pub billing_paused: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: VmId,
    pub owner_id: UserId,
    pub owner_wallet: String,
    pub name: String,
    pub vm_type: VmType,
    pub spec: VmSpec,

    pub node_id: Option<NodeId>,
    pub status: VmStatus,
    pub status_message: Option<String>,
    pub power_state: PowerState,
    pub network_config: NetworkConfig,
    pub access_info: AccessInfo,
    pub ingress_config: IngressConfig,
    pub direct_access: DirectAccess,
    pub services: Vec<String>,
    pub labels: BTreeMap<String, String>,

    pub active_command_id: Option<CommandId>,
    pub active_command_type: Option<String>,
    pub active_command_issued_at: Option<chrono::DateTime<chrono::Utc>>,

    pub billing_info: BillingInfo,

    #[serde(default)]
    pub version: u64,
}

// ------------------------------------------------------------- Obligation

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ObligationStatus {
    Pending,
    Ready,
    Running,
    WaitingForSignal,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CascadePolicy {
    CancelDependents,
    KeepOrphans,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub id: ObligationId,
    #[serde(rename = "type")]
    pub kind: String,
    pub resource_type: String,
    pub resource_id: String,
    pub priority: i32,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub status: ObligationStatus,
    pub depends_on: Vec<ObligationId>,
    pub data: BTreeMap<String, String>,
    pub failure_count: u32,
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub next_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub waiting_for_signal: Option<String>,
    pub wait_expiry: Option<chrono::DateTime<chrono::Utc>>,
    pub parent_id: Option<ObligationId>,
    pub children_ids: Vec<ObligationId>,
    pub last_error: Option<String>,
    #[serde(default = "default_cascade_policy")]
    pub cascade_policy: CascadePolicy,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// `None` means retry indefinitely (bounded only by `deadline`, if
    /// any, which the handler itself enforces) — used by `vm.schedule`
    /// when the VM has no deadline. `Some(n)` caps at `n` attempts
    /// before the obligation is marked `Failed` (spec §4.1 default: 10).
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_cascade_policy() -> CascadePolicy {
    CascadePolicy::CancelDependents
}

impl Obligation {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ObligationStatus::Completed | ObligationStatus::Failed | ObligationStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

// ------------------------------------------------------------ UsageRecord

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: UsageRecordId,
    pub vm_id: VmId,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub period_start: chrono::DateTime<chrono::Utc>,
    pub period_end: chrono::DateTime<chrono::Utc>,
    /// Fixed-point micro-USDC to avoid float drift across accrual/settlement.
    pub total_cost_micros: i64,
    pub node_share_micros: i64,
    pub platform_fee_micros: i64,
    pub attestation_verified: bool,
    pub settled_on_chain: bool,
    pub settlement_tx_hash: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ----------------------------------------------------------- CustomDomain

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CustomDomainStatus {
    Pending,
    Verified,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CustomDomain {
    pub id: CustomDomainId,
    pub vm_id: VmId,
    pub hostname: String,
    pub expected_target: String,
    pub status: CustomDomainStatus,
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
}
