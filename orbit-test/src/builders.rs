// Fluent entity builders. Every `orbit-base` test module before this
// crate hand-wrote a `sample_node`/`sample_vm` struct literal (see
// `orbit-base::store`'s tests, `orbit-scheduler::scoring`'s `node()`,
// `orbit-billing::settlement`'s `sample_node`/`sample_vm`) — this module
// is that duplication pulled into one place with sane defaults, so
// scenario tests only spell out the fields the scenario cares about.

use orbit_base::ids::{NodeId, ObligationId, UserId, VmId};
use orbit_base::model::*;
use std::collections::BTreeMap;

pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            node: Node {
                id: NodeId::new(),
                wallet_address: "0xnode".into(),
                public_ip: "10.0.0.1".into(),
                agent_port: 9000,
                region: "us-east".into(),
                zone: None,
                hardware: HardwareInventory {
                    cores: 8,
                    memory_bytes: 16 * 1024 * 1024 * 1024,
                    disk_bytes: 500 * 1024 * 1024 * 1024,
                    bandwidth_mbps: Some(1000),
                    nat_type: Some(NatType::None),
                    has_gpu: false,
                },
                performance: PerformanceEvaluation {
                    benchmark_score: 1000,
                    allowed_tiers: vec![QualityTier::Burstable, QualityTier::Standard, QualityTier::Premium],
                },
                total_resources: ResourceCounters {
                    compute_points: 100,
                    memory_bytes: 16 * 1024 * 1024 * 1024,
                    storage_bytes: 500 * 1024 * 1024 * 1024,
                },
                reserved_resources: ResourceCounters::default(),
                system_vm_obligations: Vec::new(),
                dht_info: DhtInfo::default(),
                relay_info: RelayInfo::default(),
                cgnat_info: CgnatInfo::default(),
                lifecycle: NodeLifecycle::Online,
                last_heartbeat_at: Some(chrono::Utc::now()),
                reputation_uptime_percent: 99.0,
                reputation_success_rate: 0.98,
                price_per_point: 0.01,
                version: 0,
            },
        }
    }

    pub fn id(mut self, id: NodeId) -> Self {
        self.node.id = id;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.node.region = region.into();
        self
    }

    pub fn total_points(mut self, points: u64) -> Self {
        self.node.total_resources.compute_points = points;
        self
    }

    pub fn reserved_points(mut self, points: u64) -> Self {
        self.node.reserved_resources.compute_points = points;
        self
    }

    pub fn lifecycle(mut self, lifecycle: NodeLifecycle) -> Self {
        self.node.lifecycle = lifecycle;
        self
    }

    pub fn last_heartbeat_at(mut self, at: Option<chrono::DateTime<chrono::Utc>>) -> Self {
        self.node.last_heartbeat_at = at;
        self
    }

    pub fn has_gpu(mut self, has_gpu: bool) -> Self {
        self.node.hardware.has_gpu = has_gpu;
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct VmBuilder {
    vm: VirtualMachine,
}

impl VmBuilder {
    pub fn new(owner_id: UserId) -> Self {
        Self {
            vm: VirtualMachine {
                id: VmId::new(),
                owner_id,
                owner_wallet: "0xowner".into(),
                name: "test-vm".into(),
                vm_type: VmType::User,
                spec: VmSpec {
                    virtual_cpu_cores: 2,
                    memory_bytes: 2 * 1024 * 1024 * 1024,
                    disk_bytes: 20 * 1024 * 1024 * 1024,
                    quality_tier: QualityTier::Standard,
                    compute_point_cost: 4,
                    ssh_public_key: None,
                    user_data: None,
                    region: Some("us-east".into()),
                    zone: None,
                    requires_public_ip: false,
                    requires_gpu: false,
                },
                node_id: None,
                status: VmStatus::Pending,
                status_message: None,
                power_state: PowerState::Off,
                network_config: NetworkConfig::default(),
                access_info: AccessInfo::default(),
                ingress_config: IngressConfig::default(),
                direct_access: DirectAccess::default(),
                services: Vec::new(),
                labels: BTreeMap::new(),
                active_command_id: None,
                active_command_type: None,
                active_command_issued_at: None,
                billing_info: BillingInfo::default(),
                version: 0,
            },
        }
    }

    pub fn id(mut self, id: VmId) -> Self {
        self.vm.id = id;
        self
    }

    pub fn vm_type(mut self, vm_type: VmType) -> Self {
        self.vm.vm_type = vm_type;
        self
    }

    pub fn status(mut self, status: VmStatus) -> Self {
        self.vm.status = status;
        self
    }

    pub fn node_id(mut self, node_id: Option<NodeId>) -> Self {
        self.vm.node_id = node_id;
        self
    }

    pub fn compute_point_cost(mut self, cost: u64) -> Self {
        self.vm.spec.compute_point_cost = cost;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.vm.spec.region = Some(region.into());
        self
    }

    pub fn hourly_rate(mut self, rate: f64) -> Self {
        self.vm.billing_info.hourly_rate_crypto = rate;
        self
    }

    pub fn billing_paused(mut self, paused: bool) -> Self {
        self.vm.billing_info.billing_paused = paused;
        self
    }

    pub fn last_billing_at(mut self, at: Option<chrono::DateTime<chrono::Utc>>) -> Self {
        self.vm.billing_info.last_billing_at = at;
        self
    }

    pub fn build(self) -> VirtualMachine {
        self.vm
    }
}

pub struct ObligationBuilder {
    obligation: Obligation,
}

impl ObligationBuilder {
    pub fn new(kind: impl Into<String>, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            obligation: Obligation {
                id: ObligationId::new(),
                kind: kind.into(),
                resource_type: resource_type.into(),
                resource_id: resource_id.into(),
                priority: 0,
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
            },
        }
    }

    pub fn id(mut self, id: ObligationId) -> Self {
        self.obligation.id = id;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.obligation.priority = priority;
        self
    }

    pub fn status(mut self, status: ObligationStatus) -> Self {
        self.obligation.status = status;
        self
    }

    pub fn depends_on(mut self, deps: Vec<ObligationId>) -> Self {
        self.obligation.depends_on = deps;
        self
    }

    pub fn parent_id(mut self, parent: Option<ObligationId>) -> Self {
        self.obligation.parent_id = parent;
        self
    }

    pub fn cascade_policy(mut self, policy: CascadePolicy) -> Self {
        self.obligation.cascade_policy = policy;
        self
    }

    pub fn max_retries(mut self, max: Option<u32>) -> Self {
        self.obligation.max_retries = max;
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.obligation.data.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Obligation {
        self.obligation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_builder_defaults_to_online_node_with_headroom() {
        let node = NodeBuilder::new().build();
        assert_eq!(node.lifecycle, NodeLifecycle::Online);
        assert!(node.available().compute_points > 0);
    }

    #[test]
    fn vm_builder_overrides_apply() {
        let owner = UserId::new();
        let vm = VmBuilder::new(owner)
            .status(VmStatus::Running)
            .compute_point_cost(40)
            .build();
        assert_eq!(vm.owner_id, owner);
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.spec.compute_point_cost, 40);
    }

    #[test]
    fn obligation_builder_chains_dependencies() {
        let parent = ObligationBuilder::new("vm.schedule", "vm", "v1").build();
        let child = ObligationBuilder::new("vm.provision", "vm", "v1")
            .depends_on(vec![parent.id])
            .parent_id(Some(parent.id))
            .build();
        assert_eq!(child.depends_on, vec![parent.id]);
        assert_eq!(child.parent_id, Some(parent.id));
    }
}
