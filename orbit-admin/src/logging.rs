// Global `tracing` subscriber setup, grounded on the wider pack's
// `telemetry::init` modules (e.g. ioi-network's `crates/telemetry/src/init.rs`)
// and `Hirevo-alexandrie`'s `main.rs`: an `EnvFilter` sourced from an
// env var (here `ORBIT_LOG`, defaulting to `info`) feeding either a
// compact human formatter or a JSON formatter, picked by config.

use crate::config::{LogFormat, LoggingConfig};
use orbit_base::error::{err, Result};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "ORBIT_LOG";

/// Install the process-wide subscriber. Call once, near the top of `main`.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match cfg.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.compact().try_init(),
    };
    result.map_err(|e| err(format!("installing tracing subscriber: {e}")))
}
