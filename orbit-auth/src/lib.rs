pub mod principal;
pub mod signature;

pub use principal::{Principal, Role};
pub use signature::{sign, verify, REPLAY_WINDOW};
