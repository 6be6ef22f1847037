pub mod domain;
pub mod handlers;
pub mod liveness;
pub mod scoring;
pub mod stats;
pub mod sysvm;

pub use domain::CustomDomainVerifyHandler;
pub use handlers::{
    new_vm_delete_obligation, new_vm_schedule_obligation, VmAllocatePortsHandler, VmDeleteHandler,
    VmProvisionHandler, VmRegisterIngressHandler, VmRescheduleHandler, VmScheduleHandler,
};
pub use liveness::sweep_node_liveness;
pub use scoring::{pick_node, passes_filters, score_node, ScoringWeights};
pub use stats::StatUpdateHandler;
pub use sysvm::{is_eligible, reconcile, required_roles, NodeDeploySystemVmHandler};
