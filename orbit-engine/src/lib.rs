pub mod dispatch;
pub mod graph;
pub mod handler;

pub use dispatch::{DispatchObserver, Engine};
pub use graph::{resolve, GraphResolution};
pub use handler::{backoff, Handler, HandlerOutcome, DEFAULT_MAX_RETRIES};
