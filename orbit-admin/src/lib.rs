pub mod audit;
pub mod config;
pub mod logging;
pub mod metrics;

pub use audit::{AuditEvent, AuditLog};
pub use config::{
    AuthConfig, BillingConfig, CommandConfig, Config, DispatchConfig, HeartbeatConfig, LogFormat,
    LoggingConfig, SchedulerWeightsConfig,
};
pub use metrics::{Metrics, MetricsSnapshot};
