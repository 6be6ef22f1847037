// BlockchainClient (spec §6 "External collaborator interfaces"). The
// core treats every call as fallible; a dedicated settlement obligation
// (orbit-billing) owns retrying failed submissions.

use async_trait::async_trait;
use orbit_base::error::Result;
use orbit_base::ids::VmId;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[async_trait]
pub trait BlockchainClient: Send + Sync {
    async fn get_escrow_balance(&self, wallet_address: &str) -> Result<f64>;
    async fn get_pending_deposits(&self, wallet_address: &str) -> Result<f64>;
    async fn report_usage(
        &self,
        user_wallet: &str,
        node_wallet: &str,
        amount_micros: i64,
        vm_id: VmId,
    ) -> Result<String>;
    async fn batch_report_usage(
        &self,
        users: &[String],
        nodes: &[String],
        amounts_micros: &[i64],
        vm_ids: &[VmId],
    ) -> Result<String>;
}

/// Deterministic in-memory stand-in used in tests and for local runs
/// without a configured RPC endpoint. Balances are seeded externally;
/// reports are recorded, not broadcast.
#[derive(Default)]
pub struct MockBlockchainClient {
    balances: Mutex<BTreeMap<String, f64>>,
    reports: Mutex<Vec<(String, String, i64)>>,
    next_tx_seq: Mutex<u64>,
}

impl MockBlockchainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_balance(&self, wallet_address: &str, amount: f64) {
        self.balances.lock().insert(wallet_address.to_string(), amount);
    }

    pub fn reported(&self) -> Vec<(String, String, i64)> {
        self.reports.lock().clone()
    }

    fn next_tx_hash(&self) -> String {
        let mut seq = self.next_tx_seq.lock();
        *seq += 1;
        format!("0xmock{:064x}", *seq)
    }
}

#[async_trait]
impl BlockchainClient for MockBlockchainClient {
    async fn get_escrow_balance(&self, wallet_address: &str) -> Result<f64> {
        Ok(self.balances.lock().get(wallet_address).copied().unwrap_or(0.0))
    }

    async fn get_pending_deposits(&self, _wallet_address: &str) -> Result<f64> {
        Ok(0.0)
    }

    async fn report_usage(
        &self,
        user_wallet: &str,
        node_wallet: &str,
        amount_micros: i64,
        _vm_id: VmId,
    ) -> Result<String> {
        self.reports
            .lock()
            .push((user_wallet.to_string(), node_wallet.to_string(), amount_micros));
        Ok(self.next_tx_hash())
    }

    async fn batch_report_usage(
        &self,
        users: &[String],
        nodes: &[String],
        amounts_micros: &[i64],
        _vm_ids: &[VmId],
    ) -> Result<String> {
        let mut reports = self.reports.lock();
        for ((user, node), amount) in users.iter().zip(nodes.iter()).zip(amounts_micros.iter()) {
            reports.push((user.clone(), node.clone(), *amount));
        }
        drop(reports);
        Ok(self.next_tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_balance_is_returned() {
        let client = MockBlockchainClient::new();
        client.seed_balance("0xuser", 42.0);
        assert_eq!(client.get_escrow_balance("0xuser").await.unwrap(), 42.0);
    }

    #[tokio::test]
    async fn batch_report_records_each_triple() {
        let client = MockBlockchainClient::new();
        client
            .batch_report_usage(
                &["0xu1".into(), "0xu2".into()],
                &["0xn1".into(), "0xn2".into()],
                &[100, 200],
                &[VmId::new(), VmId::new()],
            )
            .await
            .unwrap();
        assert_eq!(client.reported().len(), 2);
    }
}
