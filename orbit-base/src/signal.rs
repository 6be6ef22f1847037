// The signal bus: named latches with many producers and many waiters
// (spec §5). A `fire(key, payload)` is broadcast to every current
// waiter; to avoid the lost-wakeup where a fire lands microseconds
// before a matching wait, every fired payload is also kept in a short
// latch table so a `wait()` that arrives just after still observes it.
//
// Modeled after the teacher's `submerge-net::IOQueues` preference for
// plain, inspectable collections behind a lock rather than a bespoke
// lock-free structure — the volumes here (obligation signal traffic)
// don't warrant one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// How long a fired signal remains in the latch table for late waiters.
const LATCH_TTL: Duration = Duration::from_millis(500);

/// Bounded channel capacity per signal key; signals are small and
/// consumed quickly so this only needs to absorb bursts.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalPayload {
    /// The event the waiter was waiting for actually happened.
    Ready(String),
    /// The wait deadline elapsed with no fire (synthetic outcome).
    Expired,
}

struct Entry {
    sender: broadcast::Sender<SignalPayload>,
    latched: Option<(SignalPayload, Instant)>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
}

/// Many-producer, many-waiter named latch bus.
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Arc<Mutex<Inner>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry<'a>(inner: &'a mut Inner, key: &str) -> &'a mut Entry {
        inner.entries.entry(key.to_string()).or_insert_with(|| {
            let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
            Entry {
                sender,
                latched: None,
            }
        })
    }

    /// Broadcast `payload` to every current waiter on `key`, and latch it
    /// briefly so a `wait` arriving immediately after still sees it.
    pub fn fire(&self, key: &str, payload: SignalPayload) {
        let mut inner = self.inner.lock();
        let entry = Self::entry(&mut inner, key);
        // Ignore send errors: no active receivers just means nobody was
        // waiting synchronously, which is fine — the latch covers them.
        let _ = entry.sender.send(payload.clone());
        entry.latched = Some((payload, Instant::now()));
    }

    /// Broadcast the same payload to every currently-registered key.
    /// Used for bulk wake-ups (e.g. crash-recovery resubscription).
    pub fn fire_all(&self, payload: SignalPayload) {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner.entries.keys().cloned().collect();
        for key in keys {
            let entry = Self::entry(&mut inner, &key);
            let _ = entry.sender.send(payload.clone());
            entry.latched = Some((payload.clone(), Instant::now()));
        }
    }

    /// Wait for `key` to fire, or for `wait_for` to elapse (returning
    /// `SignalPayload::Expired`, never an error — callers always get a
    /// definite outcome, per spec §4.3's expiry semantics).
    pub async fn wait(&self, key: &str, wait_for: Duration) -> SignalPayload {
        let mut receiver = {
            let mut inner = self.inner.lock();
            let entry = Self::entry(&mut inner, key);
            if let Some((payload, at)) = &entry.latched {
                if at.elapsed() < LATCH_TTL {
                    return payload.clone();
                }
            }
            entry.sender.subscribe()
        };

        match timeout(wait_for, receiver.recv()).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_lagged_or_closed)) => SignalPayload::Expired,
            Err(_elapsed) => SignalPayload::Expired,
        }
    }

    /// Drop bookkeeping for a key once nobody will ever wait on it
    /// again (e.g. the owning command has been fully acked and its
    /// obligation completed). Purely a memory-bound, not required for
    /// correctness.
    pub fn forget(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_then_fire_delivers_payload() {
        let bus = SignalBus::new();
        let bus2 = bus.clone();
        let waiter = tokio::spawn(async move { bus2.wait("k", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.fire("k", SignalPayload::Ready("done".into()));
        let payload = waiter.await.unwrap();
        assert_eq!(payload, SignalPayload::Ready("done".into()));
    }

    #[tokio::test]
    async fn fire_then_wait_is_not_a_lost_wakeup() {
        let bus = SignalBus::new();
        bus.fire("k", SignalPayload::Ready("done".into()));
        let payload = bus.wait("k", Duration::from_secs(5)).await;
        assert_eq!(payload, SignalPayload::Ready("done".into()));
    }

    #[tokio::test]
    async fn wait_expires_with_no_fire() {
        let bus = SignalBus::new();
        let payload = bus.wait("never", Duration::from_millis(20)).await;
        assert_eq!(payload, SignalPayload::Expired);
    }

    #[tokio::test]
    async fn many_waiters_all_woken() {
        let bus = SignalBus::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = bus.clone();
            handles.push(tokio::spawn(async move {
                b.wait("fanout", Duration::from_secs(5)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.fire("fanout", SignalPayload::Ready("go".into()));
        for h in handles {
            assert_eq!(h.await.unwrap(), SignalPayload::Ready("go".into()));
        }
    }
}
