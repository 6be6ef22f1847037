// The ORBIT control-plane server. A `Server` collects together the
// resources a running process needs: the data store, the signal bus,
// the node command channel, the usage buffer, and the ambient
// config/audit/metrics from `orbit-admin`. `http` builds the axum
// router over it; `background` drives the timer loops this process
// owns alongside the HTTP listener. The obligation `Engine` itself is
// built alongside a `Server` but kept separate, since it's moved into
// its own background task rather than shared.

pub mod background;
pub mod http;

use orbit_adapt::{
    HickoryDomainVerifier, IngressConfigApplier, MockBlockchainClient, MockIngressConfigApplier,
};
use orbit_admin::{AuditLog, Config, Metrics};
use orbit_base::error::Result;
use orbit_base::signal::SignalBus;
use orbit_base::store::{shared_store, SharedStore};
use orbit_billing::{StoreUsageSink, UsageBuffer};
use orbit_engine::Engine;
use orbit_net::NodeCommandChannel;
use orbit_scheduler::{
    CustomDomainVerifyHandler, NodeDeploySystemVmHandler, StatUpdateHandler,
    VmAllocatePortsHandler, VmDeleteHandler, VmProvisionHandler, VmRegisterIngressHandler,
    VmRescheduleHandler, VmScheduleHandler,
};
use std::sync::Arc;

/// Shared application state. Cheap to clone: every field is already an
/// `Arc` or wraps one.
#[derive(Clone)]
pub struct Server {
    pub store: SharedStore,
    pub signals: SignalBus,
    pub channel: Arc<NodeCommandChannel>,
    pub blockchain: Arc<dyn orbit_adapt::BlockchainClient>,
    pub domain_verifier: Arc<dyn orbit_adapt::DomainVerifier>,
    pub usage_buffer: Arc<UsageBuffer>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub node_secret: Arc<Vec<u8>>,
}

impl Server {
    /// Wire a fresh `Server` and the `Engine` that drives it, with
    /// every VM-lifecycle and system-VM handler registered.
    pub fn new(config: Config, node_secret: Vec<u8>) -> Result<(Self, Engine)> {
        let store = shared_store();
        let signals = SignalBus::new();
        let channel = Arc::new(NodeCommandChannel::new(signals.clone()));
        let blockchain: Arc<dyn orbit_adapt::BlockchainClient> = Arc::new(MockBlockchainClient::new());
        let ingress: Arc<dyn IngressConfigApplier> = Arc::new(MockIngressConfigApplier::new());
        let domain_verifier: Arc<dyn orbit_adapt::DomainVerifier> = Arc::new(HickoryDomainVerifier::new()?);
        let metrics = Arc::new(Metrics::default());

        let mut engine = Engine::new(store.clone(), signals.clone())
            .with_tick_interval(config.dispatch.tick_interval())
            .with_ready_batch(config.dispatch.ready_batch_size)
            .with_observer(metrics.clone());
        engine.register(Arc::new(VmScheduleHandler::new(store.clone())));
        engine.register(Arc::new(VmProvisionHandler::new(store.clone(), channel.clone())));
        engine.register(Arc::new(VmRescheduleHandler::new(store.clone())));
        engine.register(Arc::new(VmDeleteHandler::new(store.clone(), channel.clone())));
        engine.register(Arc::new(VmRegisterIngressHandler::new(store.clone(), ingress)));
        engine.register(Arc::new(VmAllocatePortsHandler::new(store.clone(), channel.clone())));
        engine.register(Arc::new(NodeDeploySystemVmHandler::new(store.clone())));
        engine.register(Arc::new(CustomDomainVerifyHandler::new(store.clone(), domain_verifier.clone())));
        engine.register(Arc::new(StatUpdateHandler::new(store.clone())));

        let sink = Arc::new(StoreUsageSink::new(store.clone()));
        let usage_buffer = Arc::new(UsageBuffer::new(sink).with_flush_threshold(config.billing.flush_threshold));

        let server = Self {
            store,
            signals,
            channel,
            blockchain,
            domain_verifier,
            usage_buffer,
            audit: Arc::new(AuditLog::new(orbit_admin::audit::DEFAULT_CAPACITY)),
            metrics,
            config: Arc::new(config),
            node_secret: Arc::new(node_secret),
        };
        Ok((server, engine))
    }
}
