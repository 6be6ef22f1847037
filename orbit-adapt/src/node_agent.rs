// NodeAgentClient (spec §6): push delivery when the agent supports it;
// callers fall back to the long-poll queue (orbit-net) when this
// returns a transient error or the node has no known push endpoint.

use async_trait::async_trait;
use orbit_base::error::{err, Result};
use orbit_net::NodeCommand;
use parking_lot::Mutex;
use std::time::Duration;

#[async_trait]
pub trait NodeAgentClient: Send + Sync {
    async fn send_command(&self, node_url: &str, command: &NodeCommand) -> Result<()>;
}

/// `reqwest`-backed push client. A failed push is `TransientExternal`
/// in spirit: the caller should fall back to leaving the command on the
/// node's long-poll queue rather than treating this as fatal.
pub struct HttpNodeAgentClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNodeAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for HttpNodeAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeAgentClient for HttpNodeAgentClient {
    async fn send_command(&self, node_url: &str, command: &NodeCommand) -> Result<()> {
        let url = format!("{}/agent/commands", node_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(command)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(node_url, error = %e, "push delivery failed, caller should fall back to long-poll");
                err(format!("push command to {node_url} failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(err(format!(
                "node agent at {node_url} rejected command: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Records attempted pushes without performing network I/O, and can be
/// told to simulate an unreachable agent so callers exercise their
/// long-poll fallback path.
#[derive(Default)]
pub struct MockNodeAgentClient {
    sent: Mutex<Vec<NodeCommand>>,
    fail_next: Mutex<bool>,
}

impl MockNodeAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_send(&self) {
        *self.fail_next.lock() = true;
    }

    pub fn sent(&self) -> Vec<NodeCommand> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NodeAgentClient for MockNodeAgentClient {
    async fn send_command(&self, node_url: &str, command: &NodeCommand) -> Result<()> {
        let mut fail = self.fail_next.lock();
        if *fail {
            *fail = false;
            return Err(err(format!("simulated push failure to {node_url}")));
        }
        drop(fail);
        self.sent.lock().push(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_base::ids::VmId;
    use orbit_net::CommandType;

    fn sample_command() -> NodeCommand {
        let now = chrono::Utc::now();
        NodeCommand {
            command_id: orbit_base::ids::CommandId::new(),
            kind: CommandType::StartVm,
            payload: serde_json::json!({}),
            target_resource_id: VmId::new(),
            requires_ack: true,
            queued_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn mock_client_records_sent_commands() {
        let client = MockNodeAgentClient::new();
        let command = sample_command();
        client.send_command("http://node.local", &command).await.unwrap();
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test]
    async fn mock_client_can_simulate_a_failure() {
        let client = MockNodeAgentClient::new();
        client.fail_next_send();
        let command = sample_command();
        assert!(client.send_command("http://node.local", &command).await.is_err());
        assert!(client.send_command("http://node.local", &command).await.is_ok());
    }
}
