// The usage buffer (spec §4.5 "Usage buffer"). Generalizes the
// teacher's `submerge-net::NodeQueue` shape — a `Mutex`-guarded
// `Vec`/`VecDeque` drained by a background task — to a write-behind
// cache in front of usage-record persistence, so the accrual handler
// never blocks on the sink.

use async_trait::async_trait;
use orbit_base::error::Result;
use orbit_base::model::UsageRecord;
use orbit_base::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Flush when the buffer reaches this many records, even before the
/// timer fires (spec §4.5: "flushes every 60s or when the queue
/// reaches 100 records").
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Where a flushed batch lands. Split out from `UsageBuffer` itself so
/// tests can inject a sink that fails on demand (spec §4.5: "failed
/// flushes re-enqueue atomically").
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn write_batch(&self, records: &[UsageRecord]) -> Result<()>;
}

/// The real sink: lands records directly in the control plane's data
/// store, where the settlement cycle later reads them back out.
pub struct StoreUsageSink {
    store: SharedStore,
}

impl StoreUsageSink {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UsageSink for StoreUsageSink {
    async fn write_batch(&self, records: &[UsageRecord]) -> Result<()> {
        for record in records {
            self.store.put_usage_record(record.clone());
        }
        Ok(())
    }
}

pub struct UsageBuffer {
    pending: Mutex<Vec<UsageRecord>>,
    sink: Arc<dyn UsageSink>,
    flush_threshold: usize,
}

impl UsageBuffer {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            sink,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Enqueue a record, flushing immediately if this push crossed the
    /// size threshold.
    pub async fn push(&self, record: UsageRecord) {
        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.push(record);
            pending.len() >= self.flush_threshold
        };
        if should_flush {
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "usage buffer size-triggered flush failed");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Drain the buffer and hand it to the sink. On failure, the
    /// drained records are put back at the front of the buffer so
    /// nothing is lost and ordering is preserved for the next attempt.
    pub async fn flush(&self) -> Result<usize> {
        let batch = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *pending)
        };
        let count = batch.len();
        match self.sink.write_batch(&batch).await {
            Ok(()) => Ok(count),
            Err(e) => {
                let mut pending = self.pending.lock().await;
                let mut restored = batch;
                restored.append(&mut pending);
                *pending = restored;
                Err(e)
            }
        }
    }
}

/// Background flush loop: ticks every `interval`, and performs one
/// final flush after `cancel` fires (spec §4.5: "final flush on
/// shutdown").
pub async fn run_flush_loop(buffer: Arc<UsageBuffer>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = buffer.flush().await {
                    tracing::warn!(error = %e, "usage buffer timer flush failed");
                }
            }
            _ = cancel.cancelled() => {
                if let Err(e) = buffer.flush().await {
                    tracing::warn!(error = %e, "usage buffer final flush failed");
                }
                tracing::info!("usage buffer flush loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_base::ids::{NodeId, UsageRecordId, UserId, VmId};
    use parking_lot::Mutex as SyncMutex;

    fn sample_record() -> UsageRecord {
        let now = chrono::Utc::now();
        UsageRecord {
            id: UsageRecordId::new(),
            vm_id: VmId::new(),
            user_id: UserId::new(),
            node_id: NodeId::new(),
            period_start: now - chrono::Duration::minutes(5),
            period_end: now,
            total_cost_micros: 1000,
            node_share_micros: 950,
            platform_fee_micros: 50,
            attestation_verified: true,
            settled_on_chain: false,
            settlement_tx_hash: None,
            created_at: now,
        }
    }

    struct RecordingSink {
        batches: SyncMutex<Vec<usize>>,
    }

    #[async_trait]
    impl UsageSink for RecordingSink {
        async fn write_batch(&self, records: &[UsageRecord]) -> Result<()> {
            self.batches.lock().push(records.len());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn write_batch(&self, _records: &[UsageRecord]) -> Result<()> {
            Err(orbit_base::error::err("sink unavailable"))
        }
    }

    #[tokio::test]
    async fn push_below_threshold_does_not_flush() {
        let sink = Arc::new(RecordingSink {
            batches: SyncMutex::new(Vec::new()),
        });
        let buffer = UsageBuffer::new(sink.clone()).with_flush_threshold(100);
        buffer.push(sample_record()).await;
        assert_eq!(buffer.len().await, 1);
        assert!(sink.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn push_at_threshold_flushes_immediately() {
        let sink = Arc::new(RecordingSink {
            batches: SyncMutex::new(Vec::new()),
        });
        let buffer = UsageBuffer::new(sink.clone()).with_flush_threshold(2);
        buffer.push(sample_record()).await;
        buffer.push(sample_record()).await;
        assert_eq!(buffer.len().await, 0);
        assert_eq!(sink.batches.lock().clone(), vec![2]);
    }

    #[tokio::test]
    async fn failed_flush_reenqueues_atomically() {
        let buffer = UsageBuffer::new(Arc::new(FailingSink)).with_flush_threshold(100);
        buffer.push(sample_record()).await;
        let result = buffer.flush().await;
        assert!(result.is_err());
        assert_eq!(buffer.len().await, 1);
    }
}
