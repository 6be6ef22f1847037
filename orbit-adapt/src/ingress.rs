// IngressConfigApplier (spec §6): idempotent full-config upload model
// — resolved Open Question: `applyRoutes` always uploads the complete
// desired route set rather than a delta, so a crashed-and-retried apply
// converges instead of accumulating stale entries.

use async_trait::async_trait;
use orbit_base::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngressRoute {
    pub subdomain: String,
    pub target_private_ip: String,
    pub target_port: u16,
}

#[async_trait]
pub trait IngressConfigApplier: Send + Sync {
    async fn apply_routes(&self, routes: &[IngressRoute]) -> Result<()>;
    async fn remove_route(&self, subdomain: &str) -> Result<()>;
}

/// In-memory applier that just tracks the last-applied full state,
/// mirroring the idempotent full-upload model without a real reverse
/// proxy behind it.
#[derive(Default)]
pub struct MockIngressConfigApplier {
    routes: Mutex<BTreeMap<String, IngressRoute>>,
}

impl MockIngressConfigApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_routes(&self) -> Vec<IngressRoute> {
        self.routes.lock().values().cloned().collect()
    }
}

#[async_trait]
impl IngressConfigApplier for MockIngressConfigApplier {
    async fn apply_routes(&self, routes: &[IngressRoute]) -> Result<()> {
        let mut table = self.routes.lock();
        table.clear();
        for route in routes {
            table.insert(route.subdomain.clone(), route.clone());
        }
        Ok(())
    }

    async fn remove_route(&self, subdomain: &str) -> Result<()> {
        self.routes.lock().remove(subdomain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_is_a_full_replace_not_a_merge() {
        let applier = MockIngressConfigApplier::new();
        applier
            .apply_routes(&[IngressRoute {
                subdomain: "a".into(),
                target_private_ip: "10.0.0.1".into(),
                target_port: 80,
            }])
            .await
            .unwrap();
        applier
            .apply_routes(&[IngressRoute {
                subdomain: "b".into(),
                target_private_ip: "10.0.0.2".into(),
                target_port: 80,
            }])
            .await
            .unwrap();
        let routes = applier.current_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].subdomain, "b");
    }

    #[tokio::test]
    async fn remove_route_is_idempotent() {
        let applier = MockIngressConfigApplier::new();
        applier.remove_route("missing").await.unwrap();
        applier.remove_route("missing").await.unwrap();
    }
}
