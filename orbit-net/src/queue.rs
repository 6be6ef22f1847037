// Per-node FIFO command queue with a blocking dequeue primitive (spec
// §4.3 "Channel model"). Generalizes the teacher's
// `submerge-net::IOQueues`, which kept a plain `VecDeque<(NodeID,
// Box<[u8]>)>` per direction, from raw bytes to typed `NodeCommand`s,
// and adds the `Notify`-based blocking wait the teacher's synchronous
// model didn't need.

use crate::commands::NodeCommand;
use orbit_base::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Enqueuing past this many pending commands is rejected with
/// `Conflict` rather than growing unbounded (spec §8 boundary
/// behavior: "backpressure at a configured max depth").
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// How many commands a single long-poll may drain at once.
pub const DEFAULT_BATCH_SIZE: usize = 16;

struct Inner {
    commands: VecDeque<NodeCommand>,
}

pub struct NodeQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_depth: usize,
}

impl NodeQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                commands: VecDeque::new(),
            }),
            notify: Notify::new(),
            max_depth,
        }
    }

    pub async fn enqueue(&self, command: NodeCommand) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.commands.len() >= self.max_depth {
            return Err(Error::conflict(format!(
                "node queue at capacity ({} commands)",
                self.max_depth
            )));
        }
        inner.commands.push_back(command);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.commands.len()
    }

    /// Block for up to `wait_for`, returning whatever batch of commands
    /// (1..=`batch_size`) is available by then, possibly empty (spec
    /// §4.3: "agent calls dequeue(nodeId, waitMs) which blocks up to
    /// waitMs or until one command is available").
    pub async fn dequeue_blocking(&self, wait_for: Duration, batch_size: usize) -> Vec<NodeCommand> {
        let deadline = tokio::time::Instant::now() + wait_for;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.commands.is_empty() {
                    let mut batch = Vec::new();
                    while batch.len() < batch_size {
                        match inner.commands.pop_front() {
                            Some(cmd) => batch.push(cmd),
                            None => break,
                        }
                    }
                    return batch;
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_base::ids::{CommandId, VmId};
    use crate::commands::CommandType;

    fn sample_command() -> NodeCommand {
        let now = chrono::Utc::now();
        NodeCommand {
            command_id: CommandId::new(),
            kind: CommandType::StartVm,
            payload: serde_json::json!({}),
            target_resource_id: VmId::new(),
            requires_ack: true,
            queued_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = NodeQueue::new(DEFAULT_MAX_DEPTH);
        let first = sample_command();
        let second = sample_command();
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();
        let batch = queue
            .dequeue_blocking(Duration::from_millis(50), DEFAULT_BATCH_SIZE)
            .await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].command_id, first.command_id);
        assert_eq!(batch[1].command_id, second.command_id);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue = NodeQueue::new(DEFAULT_MAX_DEPTH);
        let start = tokio::time::Instant::now();
        let batch = queue
            .dequeue_blocking(Duration::from_millis(30), DEFAULT_BATCH_SIZE)
            .await;
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn enqueue_past_max_depth_is_rejected() {
        let queue = NodeQueue::new(1);
        queue.enqueue(sample_command()).await.unwrap();
        let result = queue.enqueue(sample_command()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(NodeQueue::new(DEFAULT_MAX_DEPTH));
        let q2 = queue.clone();
        let waiter = tokio::spawn(async move {
            q2.dequeue_blocking(Duration::from_secs(5), DEFAULT_BATCH_SIZE)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(sample_command()).await.unwrap();
        let batch = waiter.await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
