// In-memory integration harness wiring a `DataStore`, `SignalBus`,
// `NodeCommandChannel` and a fully-handler-registered `Engine` — the
// "introspection, snapshots, diagnostics, judgments" stub description
// the teacher left on `submerge-test`, shaped like the wider pack's
// testkit crates (`exonum-testkit`, `asupersync`'s `conformance`): one
// struct a scenario test builds once, then drives tick-by-tick.

use orbit_adapt::{MockBlockchainClient, MockDomainVerifier, MockIngressConfigApplier};
use orbit_base::ids::{NodeId, VmId};
use orbit_base::model::{Node, Obligation, VirtualMachine};
use orbit_base::signal::SignalBus;
use orbit_base::store::{shared_store, SharedStore};
use orbit_billing::UsageBuffer;
use orbit_engine::Engine;
use orbit_net::NodeCommandChannel;
use orbit_scheduler::{
    CustomDomainVerifyHandler, NodeDeploySystemVmHandler, StatUpdateHandler,
    VmAllocatePortsHandler, VmDeleteHandler, VmProvisionHandler, VmRegisterIngressHandler,
    VmRescheduleHandler, VmScheduleHandler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a scenario test needs, already wired with the real VM
/// lifecycle handlers and mock external collaborators.
pub struct TestHarness {
    pub store: SharedStore,
    pub signals: SignalBus,
    pub channel: Arc<NodeCommandChannel>,
    pub blockchain: Arc<MockBlockchainClient>,
    pub engine: Engine,
    pub cancel: CancellationToken,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_store(shared_store())
    }

    /// Build a harness over an already-populated store, with a brand
    /// new `SignalBus`/`NodeCommandChannel`/`Engine` — simulates a
    /// process restart (spec §8 Scenario F), where persisted
    /// obligations survive but all in-memory registries start empty.
    pub fn with_store(store: SharedStore) -> Self {
        let signals = SignalBus::new();
        let channel = Arc::new(NodeCommandChannel::new(signals.clone()));
        let blockchain = Arc::new(MockBlockchainClient::new());
        let ingress = Arc::new(MockIngressConfigApplier::new());
        let domain_verifier = Arc::new(MockDomainVerifier::new());

        let mut engine = Engine::new(store.clone(), signals.clone());
        engine.register(Arc::new(VmScheduleHandler::new(store.clone())));
        engine.register(Arc::new(VmProvisionHandler::new(store.clone(), channel.clone())));
        engine.register(Arc::new(VmRescheduleHandler::new(store.clone())));
        engine.register(Arc::new(VmDeleteHandler::new(store.clone(), channel.clone())));
        engine.register(Arc::new(VmRegisterIngressHandler::new(store.clone(), ingress)));
        engine.register(Arc::new(VmAllocatePortsHandler::new(store.clone(), channel.clone())));
        engine.register(Arc::new(NodeDeploySystemVmHandler::new(store.clone())));
        engine.register(Arc::new(CustomDomainVerifyHandler::new(store.clone(), domain_verifier)));
        engine.register(Arc::new(StatUpdateHandler::new(store.clone())));

        Self {
            store,
            signals,
            channel,
            blockchain,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    pub fn put_node(&self, node: Node) -> NodeId {
        let id = node.id;
        self.store.put_node(node);
        id
    }

    pub fn put_vm(&self, vm: VirtualMachine) -> VmId {
        let id = vm.id;
        self.store.put_vm(vm);
        id
    }

    pub fn put_obligation(&self, obligation: Obligation) {
        self.store.put_obligation(obligation);
    }

    /// Drive the dispatch loop for `n` deterministic ticks, without
    /// waiting on the tick-interval timer.
    pub async fn run_ticks(&self, n: usize) {
        for _ in 0..n {
            self.engine.tick(self.cancel.clone()).await;
        }
    }

    /// Keep ticking until `done` reports true or `max_ticks` is hit,
    /// for scenarios whose convergence point isn't a fixed tick count.
    pub async fn run_until(&self, max_ticks: usize, mut done: impl FnMut(&SharedStore) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(&self.store) {
                return true;
            }
            self.engine.tick(self.cancel.clone()).await;
        }
        done(&self.store)
    }

    pub fn usage_buffer(&self) -> Arc<UsageBuffer> {
        Arc::new(UsageBuffer::new(Arc::new(orbit_billing::StoreUsageSink::new(self.store.clone()))))
    }

    /// Run the node liveness sweep once, the way `orbitd`'s background
    /// loop would on its own timer (spec §8 Scenario C).
    pub fn sweep_liveness(&self, offline_after: chrono::Duration, decommission_after: chrono::Duration) -> usize {
        orbit_scheduler::sweep_node_liveness(&self.store, offline_after, decommission_after)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
