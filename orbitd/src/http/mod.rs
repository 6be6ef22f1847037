// HTTP surface (spec §6 "External interfaces"). Thin axum router: each
// handler talks to the `Server`'s store/channel directly and returns
// the shared `{ok, error?, data?}` envelope.

pub mod envelope;
pub mod extract;
pub mod nodes;
pub mod vms;

use crate::Server;
use axum::routing::{delete, get, post};
use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub fn router(server: Server) -> Router {
    Router::new()
        .route("/api/vms", post(vms::create_vm))
        .route("/api/vms/:id", get(vms::get_vm))
        .route("/api/vms/:id", delete(vms::delete_vm))
        .route("/api/vms/:id/action", post(vms::vm_action))
        .route("/api/nodes/register", post(nodes::register_node))
        .route("/api/nodes/:id/heartbeat", post(nodes::heartbeat))
        .route("/api/nodes/:id/commands/:cmd_id/acknowledge", post(nodes::acknowledge_command))
        .route("/api/nodes/:id/commands/dequeue", post(nodes::dequeue_commands))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(35)))
        .with_state(server)
}
