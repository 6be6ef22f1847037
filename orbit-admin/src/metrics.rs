// Process-local counters, cheap enough to bump on every dispatch tick
// without contention: plain `AtomicU64`s behind short names, snapshotted
// into a plain struct for the admin surface rather than wired to a
// dedicated metrics crate (the corpus reaches for `metrics`/`prometheus`
// only in services with an actual scrape endpoint in scope, which §6's
// endpoint table doesn't list for ORBIT).

use orbit_engine::{DispatchObserver, HandlerOutcome};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub obligations_completed: AtomicU64,
    pub obligations_failed: AtomicU64,
    pub obligations_retried: AtomicU64,
    pub vms_provisioned: AtomicU64,
    pub vms_deleted: AtomicU64,
    pub usage_records_settled: AtomicU64,
    pub usage_records_skipped_below_minimum: AtomicU64,
    pub commands_expired: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub obligations_completed: u64,
    pub obligations_failed: u64,
    pub obligations_retried: u64,
    pub vms_provisioned: u64,
    pub vms_deleted: u64,
    pub usage_records_settled: u64,
    pub usage_records_skipped_below_minimum: u64,
    pub commands_expired: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            obligations_completed: self.obligations_completed.load(Ordering::Relaxed),
            obligations_failed: self.obligations_failed.load(Ordering::Relaxed),
            obligations_retried: self.obligations_retried.load(Ordering::Relaxed),
            vms_provisioned: self.vms_provisioned.load(Ordering::Relaxed),
            vms_deleted: self.vms_deleted.load(Ordering::Relaxed),
            usage_records_settled: self.usage_records_settled.load(Ordering::Relaxed),
            usage_records_skipped_below_minimum: self.usage_records_skipped_below_minimum.load(Ordering::Relaxed),
            commands_expired: self.commands_expired.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_by(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Counts dispatch outcomes as the engine reports them, so
/// `obligations_completed`/`failed`/`retried` and the `vm.provision`/
/// `vm.delete`-specific counters stay current without either side
/// polling the other.
impl DispatchObserver for Metrics {
    fn observe(&self, obligation_kind: &str, outcome: &HandlerOutcome) {
        match outcome {
            HandlerOutcome::Completed { .. } | HandlerOutcome::CompletedWithChildren { .. } => {
                Self::incr(&self.obligations_completed);
                match obligation_kind {
                    "vm.provision" => Self::incr(&self.vms_provisioned),
                    "vm.delete" => Self::incr(&self.vms_deleted),
                    _ => {}
                }
            }
            HandlerOutcome::Retry { .. } => Self::incr(&self.obligations_retried),
            HandlerOutcome::Fail { .. } => Self::incr(&self.obligations_failed),
            HandlerOutcome::WaitForSignal { .. } => {}
        }
    }
}
