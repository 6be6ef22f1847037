// Custom-domain verification (spec §9 re-architecture item:
// `custom-domain.verify` — "runs a DNS lookup and transitions the
// domain's status; do not invent verification semantics beyond that").
// A CNAME lookup of `hostname` must resolve to `expectedTarget`.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use orbit_base::error::{err, Result};

#[async_trait]
pub trait DomainVerifier: Send + Sync {
    /// Returns `Ok(true)` if `hostname`'s CNAME chain includes
    /// `expected_target`, `Ok(false)` if the lookup succeeded but
    /// didn't match, and `Err` for a transient resolution failure.
    async fn verify_cname(&self, hostname: &str, expected_target: &str) -> Result<bool>;
}

pub struct HickoryDomainVerifier {
    resolver: TokioAsyncResolver,
}

impl HickoryDomainVerifier {
    pub fn new() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| err(format!("failed to build DNS resolver: {e}")))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DomainVerifier for HickoryDomainVerifier {
    async fn verify_cname(&self, hostname: &str, expected_target: &str) -> Result<bool> {
        let lookup = self
            .resolver
            .lookup(hostname, hickory_resolver::proto::rr::RecordType::CNAME)
            .await
            .map_err(|e| err(format!("CNAME lookup for {hostname} failed: {e}")))?;
        let expected = expected_target.trim_end_matches('.');
        Ok(lookup
            .iter()
            .filter_map(|record| record.as_cname())
            .any(|name| name.to_utf8().trim_end_matches('.') == expected))
    }
}

/// Deterministic stand-in for tests: verifies against a fixed table
/// instead of performing DNS I/O.
#[derive(Default)]
pub struct MockDomainVerifier {
    matches: std::sync::Mutex<std::collections::BTreeMap<String, String>>,
}

impl MockDomainVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cname(&self, hostname: &str, target: &str) {
        self.matches
            .lock()
            .unwrap()
            .insert(hostname.to_string(), target.to_string());
    }
}

#[async_trait]
impl DomainVerifier for MockDomainVerifier {
    async fn verify_cname(&self, hostname: &str, expected_target: &str) -> Result<bool> {
        Ok(self
            .matches
            .lock()
            .unwrap()
            .get(hostname)
            .map(|target| target == expected_target)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_cname_verifies() {
        let verifier = MockDomainVerifier::new();
        verifier.set_cname("app.example.com", "edge.orbit.network");
        assert!(verifier
            .verify_cname("app.example.com", "edge.orbit.network")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_record_does_not_verify() {
        let verifier = MockDomainVerifier::new();
        assert!(!verifier
            .verify_cname("app.example.com", "edge.orbit.network")
            .await
            .unwrap());
    }
}
