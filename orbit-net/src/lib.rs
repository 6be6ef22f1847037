pub mod channel;
pub mod commands;
pub mod queue;
pub mod registry;

pub use channel::NodeCommandChannel;
pub use commands::{CommandAck, CommandOutcome, CommandType, NodeCommand};
pub use queue::NodeQueue;
pub use registry::{PendingAck, PendingAckRegistry};
