pub mod domain_error;
pub mod error;
pub mod ids;
pub mod model;
pub mod signal;
pub mod store;

pub use domain_error::DomainError;
pub use error::{err, Error, Result};
pub use signal::{SignalBus, SignalPayload};
pub use store::{DataStore, SharedStore};
