// Layered configuration (defaults -> TOML file -> `ORBIT_` env
// overrides), in the shape of `Hirevo-alexandrie`'s `config.rs`: one
// nested struct per subsystem, each independently `Default` and
// `Deserialize`, composed into a single top-level `Config`. Every
// default here mirrors the `DEFAULT_*` constant the owning crate
// already ships, so a deployment that never writes a config file still
// gets the same behavior as the unit tests.

use orbit_base::error::{err, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub tick_interval_ms: u64,
    pub tick_jitter_ms: u64,
    pub ready_batch_size: usize,
    pub handler_timeout_secs: u64,
    pub completed_grace_window_hours: i64,
    pub max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: orbit_engine::dispatch::DEFAULT_TICK_INTERVAL.as_millis() as u64,
            tick_jitter_ms: orbit_engine::dispatch::DEFAULT_TICK_JITTER.as_millis() as u64,
            ready_batch_size: orbit_engine::dispatch::DEFAULT_READY_BATCH,
            handler_timeout_secs: orbit_engine::dispatch::DEFAULT_HANDLER_TIMEOUT.as_secs(),
            completed_grace_window_hours: orbit_engine::dispatch::DEFAULT_COMPLETED_GRACE_WINDOW.num_hours(),
            max_retries: orbit_engine::DEFAULT_MAX_RETRIES,
        }
    }
}

impl DispatchConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn tick_jitter(&self) -> Duration {
        Duration::from_millis(self.tick_jitter_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerWeightsConfig {
    pub utilization: f64,
    pub reputation: f64,
    pub price: f64,
    pub region: f64,
    pub gpu: f64,
}

impl Default for SchedulerWeightsConfig {
    fn default() -> Self {
        let w = orbit_scheduler::ScoringWeights::default();
        Self {
            utilization: w.utilization,
            reputation: w.reputation,
            price: w.price,
            region: w.region,
            gpu: w.gpu,
        }
    }
}

impl From<SchedulerWeightsConfig> for orbit_scheduler::ScoringWeights {
    fn from(c: SchedulerWeightsConfig) -> Self {
        orbit_scheduler::ScoringWeights {
            utilization: c.utilization,
            reputation: c.reputation,
            price: c.price,
            region: c.region,
            gpu: c.gpu,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub accrual_interval_secs: i64,
    pub platform_fee_bps: u32,
    pub settlement_interval_secs: u64,
    pub min_settlement_micros: i64,
    pub flush_threshold: usize,
    pub flush_interval_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            accrual_interval_secs: orbit_billing::ACCRUAL_INTERVAL.num_seconds(),
            platform_fee_bps: orbit_billing::DEFAULT_PLATFORM_FEE_BPS,
            settlement_interval_secs: orbit_billing::DEFAULT_SETTLEMENT_INTERVAL.as_secs(),
            min_settlement_micros: orbit_billing::DEFAULT_MIN_SETTLEMENT_MICROS,
            flush_threshold: orbit_billing::DEFAULT_FLUSH_THRESHOLD,
            flush_interval_secs: orbit_billing::DEFAULT_FLUSH_INTERVAL.as_secs(),
        }
    }
}

impl BillingConfig {
    pub fn accrual_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.accrual_interval_secs)
    }

    pub fn settlement_interval(&self) -> Duration {
        Duration::from_secs(self.settlement_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub ttl_secs: i64,
    pub long_poll_wait_secs: u64,
    pub queue_max_depth: usize,
    pub queue_batch_size: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ttl_secs: orbit_net::channel::DEFAULT_COMMAND_TTL.num_seconds(),
            long_poll_wait_secs: orbit_net::channel::DEFAULT_LONG_POLL_WAIT.as_secs(),
            queue_max_depth: orbit_net::queue::DEFAULT_MAX_DEPTH,
            queue_batch_size: orbit_net::queue::DEFAULT_BATCH_SIZE,
        }
    }
}

impl CommandConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs)
    }

    pub fn long_poll_wait(&self) -> Duration {
        Duration::from_secs(self.long_poll_wait_secs)
    }
}

/// Node liveness thresholds (spec §3: heartbeats every <=60s,
/// Offline past 90s, Decommissioned past 24h).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub expected_interval_secs: i64,
    pub offline_after_secs: i64,
    pub decommission_after_hours: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            expected_interval_secs: 60,
            offline_after_secs: 90,
            decommission_after_hours: 24,
        }
    }
}

impl HeartbeatConfig {
    pub fn offline_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_after_secs)
    }

    pub fn decommission_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.decommission_after_hours)
    }

    /// How often the liveness sweep polls for stale heartbeats — a
    /// fraction of `offline_after_secs` so the Online->Offline
    /// transition lands within a few seconds of the threshold.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.offline_after_secs.max(3) as u64) / 3)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub replay_window_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: orbit_auth::REPLAY_WINDOW.num_seconds(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub scheduler_weights: SchedulerWeightsConfig,
    pub billing: BillingConfig,
    pub command: CommandConfig,
    pub heartbeat: HeartbeatConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Load configuration: built-in defaults, then an optional TOML file at
/// `path` if it exists, then `ORBIT_`-prefixed environment variables
/// (double underscore as the nesting separator, e.g.
/// `ORBIT_BILLING__PLATFORM_FEE_BPS=250`).
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
    if let Some(path) = path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
    }
    builder = builder.add_source(
        config::Environment::with_prefix("ORBIT")
            .separator("__")
            .try_parsing(true),
    );
    let settled = builder.build().map_err(|e| err(format!("loading config: {e}")))?;
    settled
        .try_deserialize()
        .map_err(|e| err(format!("deserializing config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_loader() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.billing.platform_fee_bps, 500);
        assert_eq!(cfg.heartbeat.offline_after_secs, 90);
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("ORBIT_BILLING__PLATFORM_FEE_BPS", "250");
        let cfg = load(None).unwrap();
        std::env::remove_var("ORBIT_BILLING__PLATFORM_FEE_BPS");
        assert_eq!(cfg.billing.platform_fee_bps, 250);
    }

    #[test]
    fn scheduler_weights_convert_to_engine_type() {
        let weights: orbit_scheduler::ScoringWeights = SchedulerWeightsConfig::default().into();
        let default_weights = orbit_scheduler::ScoringWeights::default();
        assert_eq!(weights.utilization, default_weights.utilization);
    }
}
