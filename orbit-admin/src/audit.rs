// Administrative audit trail: every privileged mutation (VM force-stop,
// node decommission, manual settlement trigger, ...) gets one
// `AuditEvent`, both logged at `info` and kept in a bounded ring buffer
// for the `/api/admin/audit` surface. Same `Mutex<VecDeque<_>>` shape as
// `orbit-net::queue::NodeQueue`, sized instead of depth-checked since
// audit entries are meant to be dropped once the ring is full rather
// than rejected.

use orbit_base::ids::UserId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: chrono::DateTime<chrono::Utc>,
    pub actor: UserId,
    pub action: String,
    pub target: String,
    pub detail: serde_json::Value,
}

pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, actor: UserId, action: impl Into<String>, target: impl Into<String>, detail: serde_json::Value) {
        let event = AuditEvent {
            at: chrono::Utc::now(),
            actor,
            action: action.into(),
            target: target.into(),
            detail,
        };
        tracing::info!(
            target: "orbit::audit",
            actor = %event.actor,
            action = %event.action,
            target_entity = %event.target,
            detail = %event.detail,
            "admin action",
        );
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock();
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_newest_first() {
        let log = AuditLog::new(10);
        let user = UserId::new();
        log.record(user, "vm.force-stop", "vm-1", serde_json::json!({}));
        log.record(user, "vm.force-stop", "vm-2", serde_json::json!({}));
        let recent = log.recent(2);
        assert_eq!(recent[0].target, "vm-2");
        assert_eq!(recent[1].target, "vm-1");
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let log = AuditLog::new(2);
        let user = UserId::new();
        for i in 0..3 {
            log.record(user, "test", format!("t{i}"), serde_json::json!({}));
        }
        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].target, "t2");
        assert_eq!(recent[1].target, "t1");
    }
}
