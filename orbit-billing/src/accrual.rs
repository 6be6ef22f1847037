// Usage accrual (spec §4.5 "Accrual (every 5 min)"). One
// self-rescheduling obligation per running user VM, grounded on the
// same pattern `orbit-scheduler::sysvm` uses for the system-VM
// controller's recheck cadence: a `vm.bill-cycle` obligation always
// ends `Completed` with a single sibling child carrying an explicit
// `nextAttemptAt`, so the interval is exact rather than riding the
// engine's failure-count backoff ladder (which only grows on retry).

use crate::buffer::UsageBuffer;
use async_trait::async_trait;
use orbit_adapt::BlockchainClient;
use orbit_base::ids::{ObligationId, UsageRecordId, VmId};
use orbit_base::model::{CascadePolicy, Obligation, ObligationStatus, UsageRecord, VmStatus, VmType};
use orbit_base::store::SharedStore;
use orbit_engine::{Handler, HandlerOutcome};
use orbit_net::{CommandType, NodeCommandChannel};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ACCRUAL_INTERVAL: chrono::Duration = chrono::Duration::minutes(5);

/// `platformFeeBps` default (5%). Not given a concrete value in the
/// spec text; chosen as the conventional marketplace take rate and
/// recorded as an Open Question resolution.
pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 500;

fn target_vm(obligation: &Obligation) -> Result<VmId, HandlerOutcome> {
    obligation
        .resource_id
        .parse::<VmId>()
        .map_err(|_| HandlerOutcome::fail(format!("malformed vm id {}", obligation.resource_id)))
}

pub fn bill_cycle_child(vm_id: VmId, delay: chrono::Duration) -> Obligation {
    Obligation {
        id: ObligationId::new(),
        kind: "vm.bill-cycle".into(),
        resource_type: "vm".into(),
        resource_id: vm_id.to_string(),
        priority: 0,
        deadline: None,
        status: ObligationStatus::Ready,
        depends_on: Vec::new(),
        data: BTreeMap::new(),
        failure_count: 0,
        last_attempt_at: None,
        next_attempt_at: Some(chrono::Utc::now() + delay),
        waiting_for_signal: None,
        wait_expiry: None,
        parent_id: None,
        children_ids: Vec::new(),
        last_error: None,
        cascade_policy: CascadePolicy::KeepOrphans,
        completed_at: None,
        max_retries: None,
    }
}

/// `vm.bill-cycle` — accrue billing for one VM's elapsed interval, then
/// reschedule itself five minutes out. Runs for the lifetime of the VM;
/// a deleted VM simply lets the chain end (`Completed`, no child).
pub struct VmBillCycleHandler {
    store: SharedStore,
    channel: Arc<NodeCommandChannel>,
    blockchain: Arc<dyn BlockchainClient>,
    buffer: Arc<UsageBuffer>,
    platform_fee_bps: u32,
}

impl VmBillCycleHandler {
    pub fn new(
        store: SharedStore,
        channel: Arc<NodeCommandChannel>,
        blockchain: Arc<dyn BlockchainClient>,
        buffer: Arc<UsageBuffer>,
    ) -> Self {
        Self {
            store,
            channel,
            blockchain,
            buffer,
            platform_fee_bps: DEFAULT_PLATFORM_FEE_BPS,
        }
    }

    pub fn with_platform_fee_bps(mut self, bps: u32) -> Self {
        self.platform_fee_bps = bps;
        self
    }

    /// Confirmed on-chain balance minus this user's not-yet-settled
    /// usage (spec §4.5 step 3).
    async fn available_balance(&self, wallet: &str, user_id: orbit_base::ids::UserId) -> f64 {
        let on_chain = self.blockchain.get_escrow_balance(wallet).await.unwrap_or(0.0);
        let unsettled: f64 = self
            .store
            .unsettled_usage_records()
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.total_cost_micros as f64 / 1_000_000.0)
            .sum();
        on_chain - unsettled
    }

    async fn stop_for_insufficient_funds(&self, vm_id: VmId, node_id: orbit_base::ids::NodeId) {
        let _ = self
            .channel
            .send(node_id, vm_id, CommandType::StopVm, serde_json::json!({}), true)
            .await;
        let _ = self.store.update_vm(vm_id, |v| {
            v.status = VmStatus::Stopping;
            v.labels.insert("_stopped_reason".into(), "insufficient-funds".into());
            Ok(())
        });
    }
}

#[async_trait]
impl Handler for VmBillCycleHandler {
    fn obligation_type(&self) -> &'static str {
        "vm.bill-cycle"
    }

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome {
        let vm_id = match target_vm(obligation) {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Some(vm) = self.store.get_vm(vm_id) else {
            return HandlerOutcome::completed("vm no longer exists, billing chain ends");
        };
        if vm.status.is_terminal_deleted() || vm.vm_type != VmType::User {
            return HandlerOutcome::completed("vm deleted or not user-billable, billing chain ends");
        }

        let now = chrono::Utc::now();
        let last_billing = vm.billing_info.last_billing_at.unwrap_or(now);
        let elapsed = now - last_billing;

        if vm.status != VmStatus::Running {
            // Not running this interval: just move the clock forward so
            // the next cycle's `elapsed` doesn't double-count downtime.
            let _ = self.store.update_vm(vm_id, |v| {
                v.billing_info.last_billing_at = Some(now);
                Ok(())
            });
            return HandlerOutcome::CompletedWithChildren {
                children: vec![bill_cycle_child(vm_id, ACCRUAL_INTERVAL)],
                message: "vm not running, skipped accrual".into(),
            };
        }

        if vm.billing_info.billing_paused {
            let _ = self.store.update_vm(vm_id, |v| {
                v.billing_info.unverified_runtime_secs += elapsed.num_seconds().max(0) as u64;
                v.billing_info.last_billing_at = Some(now);
                Ok(())
            });
            return HandlerOutcome::CompletedWithChildren {
                children: vec![bill_cycle_child(vm_id, ACCRUAL_INTERVAL)],
                message: "attestation unverified, runtime recorded unbilled".into(),
            };
        }

        let minutes = elapsed.num_seconds().max(0) as f64 / 60.0;
        let cost = (minutes / 60.0) * vm.billing_info.hourly_rate_crypto;

        let Some(node_id) = vm.node_id else {
            return HandlerOutcome::CompletedWithChildren {
                children: vec![bill_cycle_child(vm_id, ACCRUAL_INTERVAL)],
                message: "vm has no node, skipped accrual".into(),
            };
        };

        if cost > 0.0 {
            let available = self.available_balance(&vm.owner_wallet, vm.owner_id).await;
            if available < cost {
                self.stop_for_insufficient_funds(vm_id, node_id).await;
                tracing::info!(vm_id = %vm_id, cost, available, "vm stopped for insufficient funds");
                return HandlerOutcome::completed("insufficient funds, vm stopped, billing chain ends");
            }
        }

        // Split in integer micros, not float dollars: rounding each side
        // of `cost * (1 - feeBps/10000)` independently can leave
        // `nodeShare + platformFee != totalCost` by a micro. Deriving
        // `platformFee` from `totalCost` and taking the remainder as
        // `nodeShare` keeps the spec §8 invariant exact by construction.
        let total_cost_micros = (cost * 1_000_000.0).round() as i64;
        let platform_fee_micros = total_cost_micros * self.platform_fee_bps as i64 / 10_000;
        let node_share_micros = total_cost_micros - platform_fee_micros;
        let record = UsageRecord {
            id: UsageRecordId::new(),
            vm_id,
            user_id: vm.owner_id,
            node_id,
            period_start: last_billing,
            period_end: now,
            total_cost_micros,
            node_share_micros,
            platform_fee_micros,
            attestation_verified: true,
            settled_on_chain: false,
            settlement_tx_hash: None,
            created_at: now,
        };
        self.buffer.push(record).await;

        let updated = self.store.update_vm(vm_id, |v| {
            v.billing_info.last_billing_at = Some(now);
            v.billing_info.total_billed += cost;
            v.billing_info.total_runtime_secs += elapsed.num_seconds().max(0) as u64;
            v.billing_info.verified_runtime_secs += elapsed.num_seconds().max(0) as u64;
            Ok(())
        });
        if updated.is_err() {
            return HandlerOutcome::retry("vm disappeared while recording accrual");
        }

        tracing::info!(vm_id = %vm_id, cost, "vm usage accrued");
        HandlerOutcome::CompletedWithChildren {
            children: vec![bill_cycle_child(vm_id, ACCRUAL_INTERVAL)],
            message: "accrued and rescheduled".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_adapt::MockBlockchainClient;
    use orbit_base::ids::UserId;
    use orbit_base::model::{
        AccessInfo, BillingInfo, DirectAccess, IngressConfig, NetworkConfig, PowerState, QualityTier,
        VirtualMachine, VmSpec,
    };
    use orbit_base::signal::SignalBus;

    fn running_user_vm(hourly_rate: f64, last_billing_at: Option<chrono::DateTime<chrono::Utc>>) -> VirtualMachine {
        VirtualMachine {
            id: VmId::new(),
            owner_id: UserId::new(),
            owner_wallet: "0xuser".into(),
            name: "vm".into(),
            vm_type: VmType::User,
            spec: VmSpec {
                virtual_cpu_cores: 2,
                memory_bytes: 2 * 1024 * 1024 * 1024,
                disk_bytes: 20 * 1024 * 1024 * 1024,
                quality_tier: QualityTier::Standard,
                compute_point_cost: 0,
                ssh_public_key: None,
                user_data: None,
                region: None,
                zone: None,
                requires_public_ip: false,
                requires_gpu: false,
            },
            node_id: Some(orbit_base::ids::NodeId::new()),
            status: VmStatus::Running,
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
            billing_info: BillingInfo {
                last_billing_at,
                hourly_rate_crypto: hourly_rate,
                ..Default::default()
            },
            version: 0,
        }
    }

    fn harness() -> (SharedStore, Arc<NodeCommandChannel>, Arc<MockBlockchainClient>, Arc<UsageBuffer>) {
        let store = orbit_base::store::shared_store();
        let signals = SignalBus::new();
        let channel = Arc::new(NodeCommandChannel::new(signals));
        let blockchain = Arc::new(MockBlockchainClient::new());
        let buffer = Arc::new(UsageBuffer::new(Arc::new(crate::buffer::StoreUsageSink::new(store.clone()))));
        (store, channel, blockchain, buffer)
    }

    #[tokio::test]
    async fn accrues_cost_and_reschedules_when_funded() {
        let (store, channel, blockchain, buffer) = harness();
        blockchain.seed_balance("0xuser", 100.0);
        let vm = running_user_vm(0.60, Some(chrono::Utc::now() - chrono::Duration::minutes(60)));
        let vm_id = vm.id;
        store.put_vm(vm);

        let handler = VmBillCycleHandler::new(store.clone(), channel, blockchain, buffer.clone());
        let obligation = bill_cycle_child(vm_id, chrono::Duration::zero());
        let outcome = handler.run(&obligation).await;
        match outcome {
            HandlerOutcome::CompletedWithChildren { children, .. } => {
                assert_eq!(children.len(), 1);
                assert_eq!(children[0].kind, "vm.bill-cycle");
            }
            other => panic!("expected CompletedWithChildren, got {other:?}"),
        }
        assert_eq!(buffer.len().await, 1);
        let updated = store.get_vm(vm_id).unwrap();
        assert!(updated.billing_info.total_billed > 0.0);
    }

    #[tokio::test]
    async fn stops_vm_when_balance_insufficient() {
        let (store, channel, blockchain, buffer) = harness();
        blockchain.seed_balance("0xuser", 0.10);
        let vm = running_user_vm(0.60, Some(chrono::Utc::now() - chrono::Duration::minutes(60)));
        let vm_id = vm.id;
        store.put_vm(vm);

        let handler = VmBillCycleHandler::new(store.clone(), channel, blockchain, buffer.clone());
        let obligation = bill_cycle_child(vm_id, chrono::Duration::zero());
        let outcome = handler.run(&obligation).await;
        assert!(matches!(outcome, HandlerOutcome::Completed { .. }));
        let updated = store.get_vm(vm_id).unwrap();
        assert_eq!(updated.status, VmStatus::Stopping);
        assert_eq!(
            updated.labels.get("_stopped_reason").map(String::as_str),
            Some("insufficient-funds")
        );
        assert_eq!(buffer.len().await, 0);
    }

    #[tokio::test]
    async fn billing_paused_records_unverified_runtime_without_cost() {
        let (store, channel, blockchain, buffer) = harness();
        let mut vm = running_user_vm(0.60, Some(chrono::Utc::now() - chrono::Duration::minutes(30)));
        vm.billing_info.billing_paused = true;
        let vm_id = vm.id;
        store.put_vm(vm);

        let handler = VmBillCycleHandler::new(store.clone(), channel, blockchain, buffer.clone());
        let obligation = bill_cycle_child(vm_id, chrono::Duration::zero());
        handler.run(&obligation).await;
        let updated = store.get_vm(vm_id).unwrap();
        assert!(updated.billing_info.unverified_runtime_secs > 0);
        assert_eq!(updated.billing_info.total_billed, 0.0);
        assert_eq!(buffer.len().await, 0);
    }
}
