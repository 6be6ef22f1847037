// Background timer loops the process drives alongside the HTTP
// listener: the obligation engine's tick loop, the usage-buffer flush
// loop (from `orbit-billing`) and a settlement loop (wraps
// `orbit-billing::run_settlement_cycle` to also feed its report into
// `server.metrics`), a pending-ack sweep loop for expired node
// commands, and a node liveness sweep loop. Each takes the same
// `CancellationToken` so a single shutdown signal stops all of them.

use crate::Server;
use orbit_admin::Metrics;
use orbit_billing::run_flush_loop;
use orbit_engine::Engine;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn run_engine_loop(engine: Engine, cancel: CancellationToken) {
    engine.run(cancel).await;
}

pub fn spawn_billing_loops(server: &Server, cancel: CancellationToken) {
    tokio::spawn(run_flush_loop(
        server.usage_buffer.clone(),
        server.config.billing.flush_interval(),
        cancel.clone(),
    ));
    tokio::spawn(run_settlement_loop(server.clone(), cancel));
}

/// Like `orbit_billing::run_settlement_loop`, but folds each cycle's
/// report into `server.metrics` instead of discarding it.
async fn run_settlement_loop(server: Server, cancel: CancellationToken) {
    let interval = server.config.billing.settlement_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = orbit_billing::run_settlement_cycle(
                    &server.store,
                    server.blockchain.as_ref(),
                    server.config.billing.min_settlement_micros,
                )
                .await;
                Metrics::incr_by(&server.metrics.usage_records_settled, report.records_settled as u64);
                Metrics::incr_by(
                    &server.metrics.usage_records_skipped_below_minimum,
                    report.records_skipped_below_minimum as u64,
                );
            }
            _ = cancel.cancelled() => {
                tracing::info!("settlement loop shutting down");
                return;
            }
        }
    }
}

/// Sweep the pending-ack registry for expired commands on a fixed
/// interval. Expiry itself is what wakes a handler blocked on
/// `wait_for_outcome`; this loop just drives that clock forward.
pub async fn run_command_sweep_loop(server: Server, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let expired = server.channel.sweep_expired();
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "swept expired node commands");
                    Metrics::incr_by(&server.metrics.commands_expired, expired.len() as u64);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("command sweep loop shutting down");
                return;
            }
        }
    }
}

/// Sweep node lifecycle on a fixed interval (spec §3 liveness
/// thresholds, §8 Scenario C). Downgrades nodes whose heartbeat has
/// gone stale; the VM handlers notice the downgrade on their next run
/// rather than this loop reaching into VM state directly.
pub async fn run_liveness_loop(server: Server, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let changed = orbit_scheduler::sweep_node_liveness(
                    &server.store,
                    server.config.heartbeat.offline_after(),
                    server.config.heartbeat.decommission_after(),
                );
                if changed > 0 {
                    tracing::debug!(count = changed, "node liveness sweep downgraded nodes");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("liveness sweep loop shutting down");
                return;
            }
        }
    }
}
