// `stat.update` (spec §9 re-architecture item: fire-and-forget stats
// updates scattered across controllers become an obligation so they
// share the engine's retry/observability instead of an unsupervised
// spawned task). Recomputes a node's reserved compute-point counter
// from its authoritative non-deleted VM set — the aggregate invariant
// 1 (spec §8) every VM-lifecycle handler already depends on staying
// correct.

use async_trait::async_trait;
use orbit_base::ids::NodeId;
use orbit_base::model::{Obligation, VmStatus};
use orbit_base::store::SharedStore;
use orbit_engine::{Handler, HandlerOutcome};

pub struct StatUpdateHandler {
    store: SharedStore,
}

impl StatUpdateHandler {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for StatUpdateHandler {
    fn obligation_type(&self) -> &'static str {
        "stat.update"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let Ok(node_id) = obligation.resource_id.parse::<NodeId>() else {
            return HandlerOutcome::fail(format!("malformed node id {}", obligation.resource_id));
        };
        if self.store.get_node(node_id).is_none() {
            return HandlerOutcome::completed("node no longer exists");
        }

        let reserved: u64 = self
            .store
            .vms_by_node(node_id)
            .into_iter()
            .filter(|vm| vm.status != VmStatus::Deleted)
            .map(|vm| vm.spec.compute_point_cost)
            .sum();

        match self.store.update_node(node_id, |node| {
            node.reserved_resources.compute_points = reserved;
            Ok(())
        }) {
            Ok(_) => HandlerOutcome::completed("reserved compute points recomputed"),
            Err(e) => HandlerOutcome::retry(format!("node update conflict: {e:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::child_obligation;
    use orbit_base::ids::{UserId, VmId};
    use orbit_base::model::{
        AccessInfo, BillingInfo, CgnatInfo, DhtInfo, DirectAccess, HardwareInventory, IngressConfig,
        NatType, NetworkConfig, Node, NodeLifecycle, PerformanceEvaluation, PowerState,
        QualityTier, RelayInfo, ResourceCounters, VirtualMachine, VmSpec, VmType,
    };
    use orbit_base::store::shared_store;
    use std::collections::BTreeMap;

    fn sample_node() -> Node {
        Node {
            id: NodeId::new(),
            wallet_address: "0xnode".into(),
            public_ip: "1.1.1.1".into(),
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
                allowed_tiers: vec![QualityTier::Standard],
            },
            total_resources: ResourceCounters {
                compute_points: 100,
                memory_bytes: 16 * 1024 * 1024 * 1024,
                storage_bytes: 500 * 1024 * 1024 * 1024,
            },
            reserved_resources: ResourceCounters {
                compute_points: 999,
                ..Default::default()
            },
            system_vm_obligations: vec![],
            dht_info: DhtInfo::default(),
            relay_info: RelayInfo::default(),
            cgnat_info: CgnatInfo::default(),
            lifecycle: NodeLifecycle::Online,
            last_heartbeat_at: None,
            reputation_uptime_percent: 99.0,
            reputation_success_rate: 0.98,
            price_per_point: 0.0,
            version: 0,
        }
    }

    fn sample_vm(node_id: NodeId, cost: u64, status: VmStatus) -> VirtualMachine {
        VirtualMachine {
            id: VmId::new(),
            owner_id: UserId::new(),
            owner_wallet: "0xowner".into(),
            name: "vm".into(),
            vm_type: VmType::User,
            spec: VmSpec {
                virtual_cpu_cores: 2,
                memory_bytes: 2 * 1024 * 1024 * 1024,
                disk_bytes: 20 * 1024 * 1024 * 1024,
                quality_tier: QualityTier::Standard,
                compute_point_cost: cost,
                ssh_public_key: None,
                user_data: None,
                region: None,
                zone: None,
                requires_public_ip: false,
                requires_gpu: false,
            },
            node_id: Some(node_id),
            status,
            status_message: None,
            power_state: PowerState::On,
            network_config: NetworkConfig::default(),
            access_info: AccessInfo::default(),
            ingress_config: IngressConfig::default(),
            direct_access: DirectAccess::default(),
            services: vec![],
            labels: BTreeMap::new(),
            active_command_id: None,
            active_command_type: None,
            active_command_issued_at: None,
            billing_info: BillingInfo::default(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn recomputes_reserved_points_from_non_deleted_vms() {
        let store = shared_store();
        let node = sample_node();
        let node_id = node.id;
        store.put_node(node);
        store.put_vm(sample_vm(node_id, 20, VmStatus::Running));
        store.put_vm(sample_vm(node_id, 30, VmStatus::Running));
        store.put_vm(sample_vm(node_id, 999, VmStatus::Deleted));

        let handler = StatUpdateHandler::new(store.clone());
        let obligation = child_obligation("stat.update", "node", node_id.to_string(), 0);
        let outcome = handler.run(&obligation).await;
        assert!(matches!(outcome, HandlerOutcome::Completed { .. }));
        assert_eq!(store.get_node(node_id).unwrap().reserved_resources.compute_points, 50);
    }

    #[tokio::test]
    async fn missing_node_completes_as_a_no_op() {
        let store = shared_store();
        let handler = StatUpdateHandler::new(store.clone());
        let obligation = child_obligation("stat.update", "node", NodeId::new().to_string(), 0);
        let outcome = handler.run(&obligation).await;
        assert!(matches!(outcome, HandlerOutcome::Completed { .. }));
    }
}
