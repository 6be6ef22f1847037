// Settlement batching (spec §4.5 "Settlement batches"). A plain timer
// loop rather than an obligation: there is nothing per-entity to track
// between cycles, only "all currently unsettled records", so the
// engine's dependency graph buys nothing here.

use orbit_adapt::BlockchainClient;
use orbit_base::ids::{NodeId, UserId};
use orbit_base::model::UsageRecord;
use orbit_base::store::SharedStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SETTLEMENT_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MIN_SETTLEMENT_MICROS: i64 = 1_000_000; // 1.0 USDC

pub struct SettlementReport {
    pub batches_submitted: usize,
    pub records_settled: usize,
    pub records_skipped_below_minimum: usize,
}

/// One settlement pass: group unsettled records by `(userId, nodeId)`,
/// drop groups below `min_settlement_micros`, submit the rest as one
/// batch call, and mark everything included as settled on success
/// (spec §4.5). A group's on-chain failure never touches the others —
/// each group submits and is marked independently.
pub async fn run_settlement_cycle(
    store: &SharedStore,
    blockchain: &dyn BlockchainClient,
    min_settlement_micros: i64,
) -> SettlementReport {
    let unsettled = store.unsettled_usage_records();
    let mut groups: BTreeMap<(UserId, NodeId), Vec<UsageRecord>> = BTreeMap::new();
    for record in unsettled {
        groups.entry((record.user_id, record.node_id)).or_default().push(record);
    }

    let mut batches_submitted = 0;
    let mut records_settled = 0;
    let mut records_skipped_below_minimum = 0;

    for ((_user_id, _node_id), records) in groups {
        let sum: i64 = records.iter().map(|r| r.node_share_micros).sum();
        if sum < min_settlement_micros {
            records_skipped_below_minimum += records.len();
            continue;
        }

        let Some(first) = records.first() else { continue };
        let user_wallet = match store.get_vm(first.vm_id) {
            Some(vm) => vm.owner_wallet,
            None => continue,
        };
        let Some(node) = store.get_node(first.node_id) else { continue };
        let node_wallet = node.wallet_address;

        let users: Vec<String> = records.iter().map(|_| user_wallet.clone()).collect();
        let nodes: Vec<String> = records.iter().map(|_| node_wallet.clone()).collect();
        let amounts: Vec<i64> = records.iter().map(|r| r.node_share_micros).collect();
        let vm_ids: Vec<_> = records.iter().map(|r| r.vm_id).collect();

        match blockchain.batch_report_usage(&users, &nodes, &amounts, &vm_ids).await {
            Ok(tx_hash) => {
                batches_submitted += 1;
                records_settled += records.len();
                for record in &records {
                    let mut settled = record.clone();
                    settled.settled_on_chain = true;
                    settled.settlement_tx_hash = Some(tx_hash.clone());
                    store.put_usage_record(settled);
                }
                tracing::info!(
                    tx_hash,
                    records = records.len(),
                    amount_micros = sum,
                    "settlement batch submitted"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, records = records.len(), "settlement batch failed, retrying next cycle");
            }
        }
    }

    SettlementReport {
        batches_submitted,
        records_settled,
        records_skipped_below_minimum,
    }
}

pub async fn run_settlement_loop(
    store: SharedStore,
    blockchain: Arc<dyn BlockchainClient>,
    interval: Duration,
    min_settlement_micros: i64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                run_settlement_cycle(&store, blockchain.as_ref(), min_settlement_micros).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("settlement loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_adapt::MockBlockchainClient;
    use orbit_base::ids::{UsageRecordId, VmId};
    use orbit_base::model::{
        AccessInfo, BillingInfo, DirectAccess, HardwareInventory, IngressConfig, Node, NodeLifecycle,
        NetworkConfig, PerformanceEvaluation, PowerState, QualityTier, ResourceCounters, VirtualMachine,
        VmSpec, VmStatus, VmType,
    };

    fn sample_node() -> Node {
        Node {
            id: NodeId::new(),
            wallet_address: "0xnode".into(),
            public_ip: "1.1.1.1".into(),
            agent_port: 9000,
            region: "us-east".into(),
            zone: None,
            hardware: HardwareInventory {
                cores: 4,
                memory_bytes: 8 * 1024 * 1024 * 1024,
                disk_bytes: 500 * 1024 * 1024 * 1024,
                bandwidth_mbps: Some(100),
                nat_type: None,
                has_gpu: false,
            },
            performance: PerformanceEvaluation {
                benchmark_score: 1000,
                allowed_tiers: vec![QualityTier::Standard],
            },
            total_resources: ResourceCounters {
                compute_points: 100,
                memory_bytes: 8 * 1024 * 1024 * 1024,
                storage_bytes: 500 * 1024 * 1024 * 1024,
            },
            reserved_resources: ResourceCounters::default(),
            system_vm_obligations: vec![],
            dht_info: Default::default(),
            relay_info: Default::default(),
            cgnat_info: Default::default(),
            lifecycle: NodeLifecycle::Online,
            last_heartbeat_at: None,
            reputation_uptime_percent: 99.0,
            reputation_success_rate: 0.98,
            price_per_point: 0.01,
            version: 0,
        }
    }

    fn sample_vm(owner_wallet: &str) -> VirtualMachine {
        VirtualMachine {
            id: VmId::new(),
            owner_id: UserId::new(),
            owner_wallet: owner_wallet.into(),
            name: "vm".into(),
            vm_type: VmType::User,
            spec: VmSpec {
                virtual_cpu_cores: 1,
                memory_bytes: 1024 * 1024 * 1024,
                disk_bytes: 10 * 1024 * 1024 * 1024,
                quality_tier: QualityTier::Standard,
                compute_point_cost: 0,
                ssh_public_key: None,
                user_data: None,
                region: None,
                zone: None,
                requires_public_ip: false,
                requires_gpu: false,
            },
            node_id: None,
            status: VmStatus::Running,
            status_message: None,
            power_state: PowerState::On,
            network_config: NetworkConfig::default(),
            access_info: AccessInfo::default(),
            ingress_config: IngressConfig::default(),
            direct_access: DirectAccess::default(),
            services: vec![],
            labels: Default::default(),
            active_command_id: None,
            active_command_type: None,
            active_command_issued_at: None,
            billing_info: BillingInfo::default(),
            version: 0,
        }
    }

    fn usage_record(vm_id: VmId, user_id: UserId, node_id: NodeId, node_share_micros: i64) -> UsageRecord {
        let now = chrono::Utc::now();
        UsageRecord {
            id: UsageRecordId::new(),
            vm_id,
            user_id,
            node_id,
            period_start: now - chrono::Duration::minutes(5),
            period_end: now,
            total_cost_micros: node_share_micros,
            node_share_micros,
            platform_fee_micros: 0,
            attestation_verified: true,
            settled_on_chain: false,
            settlement_tx_hash: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn group_above_minimum_settles_and_gets_tx_hash() {
        let store = orbit_base::store::shared_store();
        let node = sample_node();
        let node_id = node.id;
        store.put_node(node);
        let vm = sample_vm("0xuser1");
        let vm_id = vm.id;
        let user_id = vm.owner_id;
        store.put_vm(vm);

        let record = usage_record(vm_id, user_id, node_id, 2_000_000);
        let record_id = record.id;
        store.put_usage_record(record);

        let blockchain = MockBlockchainClient::new();
        let report = run_settlement_cycle(&store, &blockchain, DEFAULT_MIN_SETTLEMENT_MICROS).await;
        assert_eq!(report.batches_submitted, 1);
        assert_eq!(report.records_settled, 1);

        let settled = store.get_usage_record(record_id).unwrap();
        assert!(settled.settled_on_chain);
        assert!(settled.settlement_tx_hash.is_some());
    }

    #[tokio::test]
    async fn group_below_minimum_is_left_unsettled() {
        let store = orbit_base::store::shared_store();
        let node = sample_node();
        let node_id = node.id;
        store.put_node(node);
        let vm = sample_vm("0xuser2");
        let vm_id = vm.id;
        let user_id = vm.owner_id;
        store.put_vm(vm);

        let record = usage_record(vm_id, user_id, node_id, 100);
        let record_id = record.id;
        store.put_usage_record(record);

        let blockchain = MockBlockchainClient::new();
        let report = run_settlement_cycle(&store, &blockchain, DEFAULT_MIN_SETTLEMENT_MICROS).await;
        assert_eq!(report.batches_submitted, 0);
        assert_eq!(report.records_skipped_below_minimum, 1);

        let unsettled = store.get_usage_record(record_id).unwrap();
        assert!(!unsettled.settled_on_chain);
    }
}
