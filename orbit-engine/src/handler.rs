// Handler contract (spec §4.1 "Handler contract"). One handler per
// obligation `type`; the dispatcher owns mapping `failureCount` and
// `waitingForSignal` onto `ObligationStatus`, handlers only ever decide
// "what happened this attempt".

use async_trait::async_trait;
use orbit_base::model::Obligation;
use std::time::Duration;

/// What a handler did with this attempt. The dispatcher translates this
/// into status/field mutations and persists them atomically at tick end.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Terminal success. Any already-declared children are spawned.
    Completed { message: String },
    /// Terminal success that also mints new child obligations with
    /// `parentId` set to this obligation's id.
    CompletedWithChildren {
        children: Vec<Obligation>,
        message: String,
    },
    /// Not done yet; try again after a backoff computed from
    /// `failureCount`.
    Retry { reason: String },
    /// Suspend until `key` fires on the signal bus, or until `timeout`
    /// elapses (synthetic `"signal-timeout"` wake).
    WaitForSignal {
        key: String,
        reason: String,
        timeout: Duration,
    },
    /// Terminal failure. Triggers cascade-cancel per the obligation's
    /// `cascadePolicy` unless it is `KeepOrphans`.
    Fail { reason: String },
}

impl HandlerOutcome {
    pub fn completed(message: impl Into<String>) -> Self {
        Self::Completed {
            message: message.into(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn wait_for_signal(
        key: impl Into<String>,
        reason: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::WaitForSignal {
            key: key.into(),
            reason: reason.into(),
            timeout,
        }
    }
}

/// A handler executes one attempt at advancing an obligation toward
/// completion. Implementations MUST be idempotent: calling `run` twice
/// in a row for an obligation whose work is already done returns
/// `Completed` both times, with no duplicate side effect (spec §8
/// "Calling a handler twice consecutively...").
///
/// A panic inside `run` is caught by the dispatcher (it runs the
/// handler in its own task and inspects the `JoinHandle`'s result) and
/// converted to `Retry` (spec §7 "Background obligations: never throw
/// out of the handler").
#[async_trait]
pub trait Handler: Send + Sync {
    /// The obligation `type` string this handler is registered for.
    fn obligation_type(&self) -> &'static str;

    async fn run(&self, obligation: &Obligation) -> HandlerOutcome;
}

/// Default maximum retry attempts before an obligation is marked
/// `Failed` (spec §4.1 "cap at maxRetries, then Failed").
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// `min(30 s * 2^min(failureCount-1, 4), 5 min)` (spec §4.1).
pub fn backoff(failure_count: u32) -> Duration {
    let exponent = failure_count.saturating_sub(1).min(4);
    let seconds = 30u64.saturating_mul(1u64 << exponent);
    Duration::from_secs(seconds.min(300))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps_at_five_minutes() {
        assert_eq!(backoff(1), Duration::from_secs(30));
        assert_eq!(backoff(2), Duration::from_secs(60));
        assert_eq!(backoff(3), Duration::from_secs(120));
        assert_eq!(backoff(4), Duration::from_secs(240));
        assert_eq!(backoff(5), Duration::from_secs(300));
        assert_eq!(backoff(20), Duration::from_secs(300));
    }
}
