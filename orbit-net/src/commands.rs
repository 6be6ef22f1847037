// Node-facing command/ack wire types (spec §6 "Command payload"). Stable
// shape: nodes are untrusted, geographically dispersed, and may run
// older agent versions, so every field here is additive-only.

use orbit_base::ids::{CommandId, VmId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    CreateVm,
    DeleteVm,
    StartVm,
    StopVm,
    RestartVm,
    PauseVm,
    ResumeVm,
    UpdateIngress,
    AllocatePort,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub command_id: CommandId,
    #[serde(rename = "type")]
    pub kind: CommandType,
    /// Type-specific JSON payload, kept opaque here: the node-agent
    /// protocol (out of scope, spec §1) owns its shape.
    pub payload: serde_json::Value,
    pub target_resource_id: VmId,
    pub requires_ack: bool,
    pub queued_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: CommandId,
    pub success: bool,
    pub error_message: Option<String>,
    pub result_data: Option<serde_json::Value>,
}

/// The outcome a signal waiter (an obligation handler) sees once a
/// command reaches a terminal state. Distinct from `CommandAck` itself:
/// this is what's delivered over the signal bus, and covers the
/// synthetic "expired" case an ack never produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Acked(CommandAck),
    Expired,
}

impl NodeCommand {
    pub fn signal_key(command_id: CommandId) -> String {
        format!("commandAck:{command_id}")
    }
}
