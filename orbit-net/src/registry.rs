// Pending-ack registry (spec §4.3 "Pending-ack registry" and "Expiry").
// Tracks every `requiresAck=true` command until it is acked or expires,
// and fires the corresponding `commandAck:{id}` signal exactly once per
// terminal outcome either way (spec §8 invariant 5).

use crate::commands::{CommandAck, CommandOutcome, NodeCommand};
use orbit_base::ids::{CommandId, NodeId, VmId};
use orbit_base::signal::{SignalBus, SignalPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PendingAck {
    pub command_id: CommandId,
    pub vm_id: VmId,
    pub node_id: NodeId,
    pub kind: crate::commands::CommandType,
    pub queued_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Re-acks are accepted (and dropped) within this window after the
    /// first ack, per spec §4.3 "a node is allowed to re-ack within a
    /// 10-minute window".
    pub acked_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Default)]
pub struct PendingAckRegistry {
    entries: Mutex<HashMap<CommandId, PendingAck>>,
    signals: Option<SignalBus>,
}

pub const REACK_WINDOW: chrono::Duration = chrono::Duration::minutes(10);

impl PendingAckRegistry {
    pub fn new(signals: SignalBus) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            signals: Some(signals),
        }
    }

    pub fn register(&self, command: &NodeCommand, node_id: NodeId) {
        if !command.requires_ack {
            return;
        }
        self.entries.lock().insert(
            command.command_id,
            PendingAck {
                command_id: command.command_id,
                vm_id: command.target_resource_id,
                node_id,
                kind: command.kind.clone(),
                queued_at: command.queued_at,
                expires_at: command.expires_at,
                acked_at: None,
            },
        );
    }

    /// Apply an incoming ack. Returns `None` if the command is
    /// completely unknown (caller should answer 404 "unknown/already
    /// acked" per spec §4.3), `Some(true)` if this ack was the one that
    /// fired the signal, `Some(false)` if it was a harmless re-ack.
    pub fn ack(&self, ack: CommandAck) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&ack.command_id)?;
        if let Some(acked_at) = entry.acked_at {
            let now = chrono::Utc::now();
            if now - acked_at <= REACK_WINDOW {
                return Some(false);
            }
            // Outside the re-ack window: treat as unknown, matching the
            // "already acked" 404 behavior.
            return None;
        }
        entry.acked_at = Some(chrono::Utc::now());
        let key = NodeCommand::signal_key(ack.command_id);
        if let Some(bus) = &self.signals {
            bus.fire(&key, SignalPayload::Ready(encode_outcome(&CommandOutcome::Acked(ack))));
        }
        Some(true)
    }

    pub fn get(&self, command_id: CommandId) -> Option<PendingAck> {
        self.entries.lock().get(&command_id).cloned()
    }

    /// Sweep expired entries, firing the expiry signal for each and
    /// removing it from the registry (spec §4.3 "Expiry": "a
    /// background sweeper scans the registry").
    pub fn sweep_expired(&self) -> Vec<CommandId> {
        let now = chrono::Utc::now();
        let mut expired = Vec::new();
        let mut entries = self.entries.lock();
        entries.retain(|id, entry| {
            if entry.acked_at.is_none() && entry.expires_at <= now {
                expired.push(*id);
                false
            } else {
                true
            }
        });
        drop(entries);
        if let Some(bus) = &self.signals {
            for id in &expired {
                let key = NodeCommand::signal_key(*id);
                bus.fire(&key, SignalPayload::Expired);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode_outcome(outcome: &CommandOutcome) -> String {
    serde_json::to_string(outcome).unwrap_or_default()
}

pub type SharedRegistry = Arc<PendingAckRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandType;

    fn sample_command(requires_ack: bool) -> NodeCommand {
        let now = chrono::Utc::now();
        NodeCommand {
            command_id: CommandId::new(),
            kind: CommandType::StartVm,
            payload: serde_json::json!({}),
            target_resource_id: VmId::new(),
            requires_ack,
            queued_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn unknown_ack_returns_none() {
        let registry = PendingAckRegistry::new(SignalBus::new());
        let ack = CommandAck {
            command_id: CommandId::new(),
            success: true,
            error_message: None,
            result_data: None,
        };
        assert_eq!(registry.ack(ack), None);
    }

    #[test]
    fn first_ack_fires_then_reack_is_dropped() {
        let registry = PendingAckRegistry::new(SignalBus::new());
        let command = sample_command(true);
        registry.register(&command, NodeId::new());
        let ack = CommandAck {
            command_id: command.command_id,
            success: true,
            error_message: None,
            result_data: None,
        };
        assert_eq!(registry.ack(ack.clone()), Some(true));
        assert_eq!(registry.ack(ack), Some(false));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let registry = PendingAckRegistry::new(SignalBus::new());
        let mut command = sample_command(true);
        command.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        registry.register(&command, NodeId::new());
        let expired = registry.sweep_expired();
        assert_eq!(expired, vec![command.command_id]);
        assert!(registry.is_empty());
    }
}
