pub mod builders;
pub mod harness;
pub mod invariants;

pub use builders::{NodeBuilder, ObligationBuilder, VmBuilder};
pub use harness::TestHarness;
