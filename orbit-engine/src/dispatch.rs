// The dispatch loop (spec §4.1 "Dispatch loop"). Grounded on the
// teacher's own narration of the (abandoned) OceanVista watermark
// protocol in `orbit-engine`'s module doc before this rewrite, and on
// the DAG-aware orchestrator pattern (ready-set -> bounded-concurrency
// spawn -> mpsc collection -> apply-result) used for task scheduling in
// the wider example pack.

use crate::graph::resolve;
use crate::handler::{backoff, Handler, HandlerOutcome};
use orbit_base::ids::ObligationId;
use orbit_base::model::{CascadePolicy, Obligation, ObligationStatus};
use orbit_base::signal::{SignalBus, SignalPayload};
use orbit_base::store::SharedStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TICK_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_READY_BATCH: usize = 32;
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPLETED_GRACE_WINDOW: chrono::Duration = chrono::Duration::hours(1);

/// Lets a caller count dispatch outcomes (e.g. into `orbit-admin`'s
/// process metrics) without the engine depending on whatever crate
/// does the counting — `orbit-admin` already depends on `orbit-engine`,
/// not the other way around, so the observer has to be this kind of
/// callback rather than a concrete field here.
pub trait DispatchObserver: Send + Sync {
    fn observe(&self, obligation_kind: &str, outcome: &HandlerOutcome);
}

struct AttemptDone {
    obligation_id: ObligationId,
    outcome: Result<HandlerOutcome, String>,
}

/// Owns the handler registry and drives the tick loop. One engine per
/// process; all obligation types share the same dispatch cycle.
pub struct Engine {
    store: SharedStore,
    signals: SignalBus,
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
    max_concurrency: usize,
    ready_batch: usize,
    tick_interval: Duration,
    observer: Option<Arc<dyn DispatchObserver>>,
}

impl Engine {
    pub fn new(store: SharedStore, signals: SignalBus) -> Self {
        Self {
            store,
            signals,
            handlers: HashMap::new(),
            max_concurrency: DEFAULT_READY_BATCH,
            ready_batch: DEFAULT_READY_BATCH,
            tick_interval: DEFAULT_TICK_INTERVAL,
            observer: None,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.obligation_type(), handler);
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_ready_batch(mut self, batch: usize) -> Self {
        self.ready_batch = batch;
        self.max_concurrency = batch;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run the tick loop until `cancel` fires. Each tick is jittered by
    /// up to `DEFAULT_TICK_JITTER` to avoid thundering-herd ticking
    /// across a fleet of control-plane replicas.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let jitter = Duration::from_millis(rand::random::<u64>() % DEFAULT_TICK_JITTER.as_millis() as u64);
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval + jitter) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("obligation engine shutting down");
                    return;
                }
            }
            self.tick(cancel.clone()).await;
        }
    }

    /// Execute a single tick. Public so callers (and tests) can drive
    /// it deterministically instead of waiting on the interval timer.
    pub async fn tick(&self, cancel: CancellationToken) {
        self.deliver_expired_signal_waits();
        self.prune_completed();

        let active = self.store.active_obligations();
        let resolution = resolve(&active);

        for id in &resolution.cycle_participants {
            if let Some(ob) = self.store.get_obligation(*id) {
                tracing::warn!(obligation_id = %id, kind = %ob.kind, "obligation cycle detected");
                self.fail(ob, "cycle".into());
            }
        }

        let now = chrono::Utc::now();
        let ready_ids: Vec<ObligationId> = resolution
            .ready
            .into_iter()
            .filter(|id| {
                self.store
                    .get_obligation(*id)
                    .and_then(|o| o.next_attempt_at)
                    .map(|at| at <= now)
                    .unwrap_or(true)
            })
            .take(self.ready_batch)
            .collect();
        if ready_ids.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let (tx, mut rx) = mpsc::channel::<AttemptDone>(ready_ids.len().max(1));

        for id in &ready_ids {
            let Some(mut obligation) = self.store.get_obligation(*id) else {
                continue;
            };
            let Some(handler) = self.handlers.get(obligation.kind.as_str()).cloned() else {
                tracing::error!(obligation_id = %id, kind = %obligation.kind, "no handler registered for obligation type");
                continue;
            };
            obligation.status = ObligationStatus::Running;
            self.store.put_obligation(obligation.clone());

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let tx = tx.clone();
            let cancel = cancel.clone();
            let obligation_id = obligation.id;

            tokio::spawn(async move {
                // Run the handler in its own task so a panic inside
                // `run` unwinds there, not here: awaiting the
                // `JoinHandle` turns it into an `Err` we can see and
                // retry from, instead of silently dropping this task
                // before it reaches `tx.send` below (spec §7
                // "Background obligations: never throw out of the
                // handler" — that's a contract on handler authors, this
                // is the dispatcher's backstop for when they slip).
                let mut handle = tokio::spawn(async move {
                    tokio::time::timeout(DEFAULT_HANDLER_TIMEOUT, handler.run(&obligation)).await
                });
                let outcome = tokio::select! {
                    joined = &mut handle => {
                        match joined {
                            Ok(Ok(outcome)) => Ok(outcome),
                            Ok(Err(_elapsed)) => Ok(HandlerOutcome::retry("handler-timeout")),
                            Err(join_err) => {
                                tracing::error!(obligation_id = %obligation_id, "handler task panicked: {join_err}");
                                Ok(HandlerOutcome::retry("handler-panic"))
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        handle.abort();
                        Err("cancelled".to_string())
                    }
                };
                drop(permit);
                let _ = tx.send(AttemptDone { obligation_id, outcome }).await;
            });
        }
        drop(tx);

        while let Some(done) = rx.recv().await {
            self.apply(done);
        }
    }

    fn apply(&self, done: AttemptDone) {
        let Some(obligation) = self.store.get_obligation(done.obligation_id) else {
            return;
        };
        if let (Some(observer), Ok(outcome)) = (&self.observer, &done.outcome) {
            observer.observe(&obligation.kind, outcome);
        }
        match done.outcome {
            Err(_cancelled) => {
                // Shutdown mid-flight: leave it `Running`; crash
                // recovery on the next start resets it to `Ready`.
            }
            Ok(HandlerOutcome::Completed { message }) => {
                self.complete(obligation, message);
            }
            Ok(HandlerOutcome::CompletedWithChildren { children, message }) => {
                for mut child in children {
                    child.parent_id = Some(obligation.id);
                    self.store.put_obligation(child);
                }
                self.complete(obligation, message);
            }
            Ok(HandlerOutcome::Retry { reason }) => {
                self.retry(obligation, reason);
            }
            Ok(HandlerOutcome::WaitForSignal { key, reason, timeout } ) => {
                let mut obligation = obligation;
                obligation.status = ObligationStatus::WaitingForSignal;
                obligation.waiting_for_signal = Some(key);
                obligation.wait_expiry = Some(chrono::Utc::now() + chrono_duration_from_std(timeout));
                obligation.last_error = Some(reason);
                obligation.last_attempt_at = Some(chrono::Utc::now());
                self.store.put_obligation(obligation);
            }
            Ok(HandlerOutcome::Fail { reason }) => {
                self.fail(obligation, reason);
            }
        }
    }

    fn complete(&self, mut obligation: Obligation, message: String) {
        obligation.status = ObligationStatus::Completed;
        obligation.last_error = None;
        obligation.last_attempt_at = Some(chrono::Utc::now());
        obligation.completed_at = Some(chrono::Utc::now());
        obligation.waiting_for_signal = None;
        obligation.wait_expiry = None;
        tracing::info!(obligation_id = %obligation.id, kind = %obligation.kind, %message, "obligation completed");
        self.store.put_obligation(obligation);
    }

    fn retry(&self, mut obligation: Obligation, reason: String) {
        obligation.failure_count += 1;
        obligation.last_error = Some(reason);
        obligation.last_attempt_at = Some(chrono::Utc::now());
        // `None` means retry indefinitely (spec §4.1's exception for
        // `vm.schedule` obligations with no deadline); `Some(n)` caps at
        // `n` attempts.
        if let Some(max) = obligation.max_retries {
            if obligation.failure_count >= max {
                self.fail(obligation, "max retries exceeded".into());
                return;
            }
        }
        obligation.status = ObligationStatus::Ready;
        obligation.next_attempt_at = Some(chrono::Utc::now() + chrono_duration_from_std(backoff(obligation.failure_count)));
        self.store.put_obligation(obligation);
    }

    fn fail(&self, mut obligation: Obligation, reason: String) {
        obligation.status = ObligationStatus::Failed;
        obligation.last_error = Some(reason);
        obligation.last_attempt_at = Some(chrono::Utc::now());
        let policy = obligation.cascade_policy;
        let failed_id = obligation.id;
        self.store.put_obligation(obligation);
        if policy == CascadePolicy::CancelDependents {
            self.cascade_cancel(failed_id);
        }
    }

    /// Cancel the transitive closure of dependents of `root` computed
    /// from the reverse adjacency of the full active set (spec §4.1
    /// "Cascade-cancel").
    fn cascade_cancel(&self, root: ObligationId) {
        let active = self.store.active_obligations();
        let mut reverse: BTreeMap<ObligationId, Vec<ObligationId>> = BTreeMap::new();
        for o in &active {
            for dep in &o.depends_on {
                reverse.entry(*dep).or_default().push(o.id);
            }
        }
        let mut to_visit = vec![root];
        let mut cancelled: BTreeSet<ObligationId> = BTreeSet::new();
        while let Some(id) = to_visit.pop() {
            let Some(children) = reverse.get(&id) else { continue };
            for child_id in children {
                if !cancelled.insert(*child_id) {
                    continue;
                }
                if let Some(mut child) = self.store.get_obligation(*child_id) {
                    if child.is_active() {
                        child.status = ObligationStatus::Cancelled;
                        child.last_error = Some(format!("cascade-cancelled by {root}"));
                        self.store.put_obligation(child);
                    }
                }
                to_visit.push(*child_id);
            }
        }
    }

    fn deliver_expired_signal_waits(&self) {
        let now = chrono::Utc::now();
        for mut obligation in self.store.obligations_by_status(ObligationStatus::WaitingForSignal) {
            if let Some(expiry) = obligation.wait_expiry {
                if expiry <= now {
                    obligation.status = ObligationStatus::Ready;
                    obligation.last_error = Some("signal-timeout".into());
                    obligation.waiting_for_signal = None;
                    obligation.wait_expiry = None;
                    self.store.put_obligation(obligation);
                }
            }
        }
    }

    /// Wake a single waiting obligation when its signal fires. Intended
    /// to be wired as a callback from whatever fires the signal (e.g.
    /// the pending-ack registry), not called from the tick loop itself,
    /// since the engine doesn't know which keys exist ahead of time.
    pub fn wake(&self, obligation_id: ObligationId) {
        if let Some(mut obligation) = self.store.get_obligation(obligation_id) {
            if obligation.status == ObligationStatus::WaitingForSignal {
                obligation.status = ObligationStatus::Ready;
                obligation.waiting_for_signal = None;
                obligation.wait_expiry = None;
                self.store.put_obligation(obligation);
            }
        }
    }

    fn prune_completed(&self) {
        let now = chrono::Utc::now();
        for obligation in self.store.obligations_by_status(ObligationStatus::Completed) {
            if let Some(completed_at) = obligation.completed_at {
                if now - completed_at > DEFAULT_COMPLETED_GRACE_WINDOW {
                    self.store.remove_obligation(obligation.id);
                }
            }
        }
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// Emit `SignalPayload::Ready`/`Expired` and wake any obligation
    /// parked on `key` (used by callers outside the engine, e.g. the
    /// node command channel delivering a `commandAck:{id}`).
    pub fn fire(&self, key: &str, payload: SignalPayload) {
        self.signals.fire(key, payload);
    }
}

fn chrono_duration_from_std(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::seconds(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orbit_base::ids::{ObligationId, VmId};
    use orbit_base::model::CascadePolicy;
    use orbit_base::store::DataStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_obligation(kind: &str, depends_on: Vec<ObligationId>) -> Obligation {
        Obligation {
            id: ObligationId::new(),
            kind: kind.into(),
            resource_type: "vm".into(),
            resource_id: VmId::new().to_string(),
            priority: 0,
            deadline: None,
            status: ObligationStatus::Ready,
            depends_on,
            data: Default::default(),
            failure_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            waiting_for_signal: None,
            wait_expiry: None,
            parent_id: None,
            children_ids: Vec::new(),
            last_error: None,
            cascade_policy: CascadePolicy::CancelDependents,
            completed_at: None,
            max_retries: Some(10),
        }
    }

    struct AlwaysComplete;
    #[async_trait]
    impl Handler for AlwaysComplete {
        fn obligation_type(&self) -> &'static str {
            "test.complete"
        }
        async fn run(&self, _: &Obligation) -> HandlerOutcome {
            HandlerOutcome::completed("ok")
        }
    }

    struct CountingFailure {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl Handler for CountingFailure {
        fn obligation_type(&self) -> &'static str {
            "test.fail"
        }
        async fn run(&self, _: &Obligation) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::fail("boom")
        }
    }

    #[tokio::test]
    async fn tick_completes_ready_obligation() {
        let store = Arc::new(DataStore::new());
        let mut engine = Engine::new(store.clone(), SignalBus::new());
        engine.register(Arc::new(AlwaysComplete));
        let obligation = sample_obligation("test.complete", vec![]);
        store.put_obligation(obligation.clone());

        engine.tick(CancellationToken::new()).await;

        let updated = store.get_obligation(obligation.id).unwrap();
        assert_eq!(updated.status, ObligationStatus::Completed);
    }

    #[tokio::test]
    async fn failing_obligation_cascades_to_dependents() {
        let store = Arc::new(DataStore::new());
        let mut engine = Engine::new(store.clone(), SignalBus::new());
        engine.register(Arc::new(CountingFailure {
            calls: AtomicUsize::new(0),
        }));
        engine.register(Arc::new(AlwaysComplete));

        let parent = sample_obligation("test.fail", vec![]);
        let child = sample_obligation("test.complete", vec![parent.id]);
        store.put_obligation(parent.clone());
        store.put_obligation(child.clone());

        engine.tick(CancellationToken::new()).await;
        let parent_after = store.get_obligation(parent.id).unwrap();
        assert_eq!(parent_after.status, ObligationStatus::Failed);
        let child_after = store.get_obligation(child.id).unwrap();
        assert_eq!(child_after.status, ObligationStatus::Cancelled);
    }

    struct AlwaysPanics;
    #[async_trait]
    impl Handler for AlwaysPanics {
        fn obligation_type(&self) -> &'static str {
            "test.panic"
        }
        async fn run(&self, _: &Obligation) -> HandlerOutcome {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_retried_not_wedged() {
        let store = Arc::new(DataStore::new());
        let mut engine = Engine::new(store.clone(), SignalBus::new());
        engine.register(Arc::new(AlwaysPanics));
        let obligation = sample_obligation("test.panic", vec![]);
        store.put_obligation(obligation.clone());

        engine.tick(CancellationToken::new()).await;

        let updated = store.get_obligation(obligation.id).unwrap();
        assert_eq!(updated.status, ObligationStatus::Ready);
        assert_eq!(updated.failure_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("handler-panic"));
    }

    #[tokio::test]
    async fn dependent_only_dispatches_after_dependency_completes() {
        let store = Arc::new(DataStore::new());
        let mut engine = Engine::new(store.clone(), SignalBus::new());
        engine.register(Arc::new(AlwaysComplete));

        let parent = sample_obligation("test.complete", vec![]);
        let child = sample_obligation("test.complete", vec![parent.id]);
        store.put_obligation(parent.clone());
        store.put_obligation(child.clone());

        engine.tick(CancellationToken::new()).await;
        assert_eq!(store.get_obligation(child.id).unwrap().status, ObligationStatus::Ready);

        engine.tick(CancellationToken::new()).await;
        assert_eq!(store.get_obligation(child.id).unwrap().status, ObligationStatus::Completed);
    }
}
