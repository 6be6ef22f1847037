// Node liveness decay (spec §3: heartbeats every <=60s, node goes
// Offline past 90s silent, Decommissioned past a longer outage).
// Plain polling over the store, not an obligation handler: lifecycle
// decay is a property of wall-clock time passing relative to the last
// heartbeat, not work that needs the engine's retry/backoff machinery.

use orbit_base::model::NodeLifecycle;
use orbit_base::store::SharedStore;
use chrono::Duration;

/// Downgrade every node whose last heartbeat is older than the given
/// thresholds. Returns the number of nodes whose lifecycle changed.
/// Called on a fixed interval from the process's background loops
/// (spec §8 boundary: "heartbeat arriving 91s after last: node
/// Online->Offline on that tick").
pub fn sweep_node_liveness(store: &SharedStore, offline_after: Duration, decommission_after: Duration) -> usize {
    let now = chrono::Utc::now();
    let mut changed = 0;
    for node in store.all_nodes() {
        let Some(last) = node.last_heartbeat_at else {
            continue;
        };
        let elapsed = now - last;
        let next = match node.lifecycle {
            NodeLifecycle::Online if elapsed > offline_after => Some(NodeLifecycle::Offline),
            NodeLifecycle::Offline if elapsed > decommission_after => Some(NodeLifecycle::Decommissioned),
            _ => None,
        };
        let Some(next) = next else {
            continue;
        };
        let node_id = node.id;
        if store
            .update_node(node_id, |n| {
                n.lifecycle = next;
                Ok(())
            })
            .is_ok()
        {
            tracing::info!(%node_id, lifecycle = ?next, "node liveness decayed");
            changed += 1;
        }
    }
    changed
}
