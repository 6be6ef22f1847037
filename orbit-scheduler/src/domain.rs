// `custom-domain.verify` (spec §9 Open Questions supplement): a DNS
// CNAME lookup for a domain pointed at a VM's ingress hostname. No
// semantics beyond "matches expected target -> Verified, else retry
// until a deadline -> Failed" are invented.

use async_trait::async_trait;
use orbit_adapt::DomainVerifier;
use orbit_base::ids::CustomDomainId;
use orbit_base::model::CustomDomainStatus;
use orbit_base::store::SharedStore;
use orbit_engine::{Handler, HandlerOutcome};
use std::sync::Arc;

pub struct CustomDomainVerifyHandler {
    store: SharedStore,
    verifier: Arc<dyn DomainVerifier>,
}

impl CustomDomainVerifyHandler {
    pub fn new(store: SharedStore, verifier: Arc<dyn DomainVerifier>) -> Self {
        Self { store, verifier }
    }
}

#[async_trait]
impl Handler for CustomDomainVerifyHandler {
    fn obligation_type(&self) -> &'static str {
        "custom-domain.verify"
    }

    async fn run(&self, obligation: &orbit_base::model::Obligation) -> HandlerOutcome {
        let Ok(domain_id) = obligation.resource_id.parse::<CustomDomainId>() else {
            return HandlerOutcome::fail(format!("malformed custom domain id {}", obligation.resource_id));
        };
        let Some(domain) = self.store.get_custom_domain(domain_id) else {
            return HandlerOutcome::completed("custom domain no longer exists");
        };
        if domain.status != CustomDomainStatus::Pending {
            return HandlerOutcome::completed("already verified");
        }

        match self.verifier.verify_cname(&domain.hostname, &domain.expected_target).await {
            Ok(true) => {
                let mut verified = domain.clone();
                verified.status = CustomDomainStatus::Verified;
                verified.last_checked_at = Some(chrono::Utc::now());
                self.store.put_custom_domain(verified);
                HandlerOutcome::completed("cname matches expected target")
            }
            Ok(false) => {
                let mut checked = domain.clone();
                checked.last_checked_at = Some(chrono::Utc::now());
                self.store.put_custom_domain(checked);
                if let Some(deadline) = obligation.deadline {
                    if chrono::Utc::now() >= deadline {
                        let mut failed = domain;
                        failed.status = CustomDomainStatus::Failed;
                        self.store.put_custom_domain(failed);
                        return HandlerOutcome::fail("cname never matched expected target before deadline");
                    }
                }
                HandlerOutcome::retry("cname does not yet match expected target")
            }
            Err(e) => HandlerOutcome::retry(format!("dns lookup failed: {e:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orbit_base::error::Result;
    use orbit_base::ids::VmId;
    use orbit_base::model::CustomDomain;
    use orbit_base::store::shared_store;
    use parking_lot::Mutex;

    struct StubVerifier {
        result: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl DomainVerifier for StubVerifier {
        async fn verify_cname(&self, _hostname: &str, _expected_target: &str) -> Result<bool> {
            Ok((*self.result.lock()).unwrap_or(false))
        }
    }

    fn sample_domain() -> CustomDomain {
        CustomDomain {
            id: CustomDomainId::new(),
            vm_id: VmId::new(),
            hostname: "example.com".into(),
            expected_target: "vm123.orbit.dev".into(),
            status: CustomDomainStatus::Pending,
            last_checked_at: None,
        }
    }

    fn obligation_for(domain_id: CustomDomainId) -> orbit_base::model::Obligation {
        use orbit_base::model::{CascadePolicy, ObligationStatus};
        use std::collections::BTreeMap;
        orbit_base::model::Obligation {
            id: orbit_base::ids::ObligationId::new(),
            kind: "custom-domain.verify".into(),
            resource_type: "custom-domain".into(),
            resource_id: domain_id.to_string(),
            priority: 0,
            deadline: None,
            status: ObligationStatus::Ready,
            depends_on: Vec::new(),
            data: BTreeMap::new(),
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

    #[tokio::test]
    async fn matching_cname_marks_domain_verified() {
        let store = shared_store();
        let domain = sample_domain();
        let domain_id = domain.id;
        store.put_custom_domain(domain);
        let handler = CustomDomainVerifyHandler::new(
            store.clone(),
            Arc::new(StubVerifier { result: Mutex::new(Some(true)) }),
        );
        let outcome = handler.run(&obligation_for(domain_id)).await;
        assert!(matches!(outcome, HandlerOutcome::Completed { .. }));
        assert_eq!(store.get_custom_domain(domain_id).unwrap().status, CustomDomainStatus::Verified);
    }

    #[tokio::test]
    async fn mismatched_cname_retries_without_deadline() {
        let store = shared_store();
        let domain = sample_domain();
        let domain_id = domain.id;
        store.put_custom_domain(domain);
        let handler = CustomDomainVerifyHandler::new(
            store.clone(),
            Arc::new(StubVerifier { result: Mutex::new(Some(false)) }),
        );
        let outcome = handler.run(&obligation_for(domain_id)).await;
        assert!(matches!(outcome, HandlerOutcome::Retry { .. }));
        assert_eq!(store.get_custom_domain(domain_id).unwrap().status, CustomDomainStatus::Pending);
    }

    #[tokio::test]
    async fn mismatched_cname_past_deadline_fails_and_marks_domain_failed() {
        let store = shared_store();
        let domain = sample_domain();
        let domain_id = domain.id;
        store.put_custom_domain(domain);
        let handler = CustomDomainVerifyHandler::new(
            store.clone(),
            Arc::new(StubVerifier { result: Mutex::new(Some(false)) }),
        );
        let mut obligation = obligation_for(domain_id);
        obligation.deadline = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let outcome = handler.run(&obligation).await;
        assert!(matches!(outcome, HandlerOutcome::Fail { .. }));
        assert_eq!(store.get_custom_domain(domain_id).unwrap().status, CustomDomainStatus::Failed);
    }
}
