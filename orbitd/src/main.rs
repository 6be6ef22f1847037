// Process entrypoint: parse CLI args, load config, install logging,
// build the `Server`/`Engine` pair, and run the HTTP listener alongside
// the three background loops under one shared shutdown signal.

use clap::Parser;
use orbit_base::error::{err, Result};
use orbitd::background;
use orbitd::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(about = "ORBIT control-plane server", version)]
struct Opts {
    /// Path to a TOML configuration file. Missing is fine; defaults apply.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address the HTTP API listens on.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Shared secret used to verify node-signed requests (spec §9 "node
    /// trust boundary"). Read from `ORBIT_NODE_SECRET` if unset.
    #[arg(long, env = "ORBIT_NODE_SECRET")]
    pub node_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = orbit_admin::config::load(opts.config.as_deref())?;
    orbit_admin::logging::init(&config.logging)?;

    tracing::info!(bind = %opts.bind, "starting orbitd");

    let (server, engine) = Server::new(config, opts.node_secret.into_bytes())?;
    let cancel = CancellationToken::new();

    let engine_task = tokio::spawn(background::run_engine_loop(engine, cancel.clone()));
    background::spawn_billing_loops(&server, cancel.clone());
    let sweep_task = tokio::spawn(background::run_command_sweep_loop(
        server.clone(),
        server.config.command.long_poll_wait(),
        cancel.clone(),
    ));
    let liveness_task = tokio::spawn(background::run_liveness_loop(
        server.clone(),
        server.config.heartbeat.sweep_interval(),
        cancel.clone(),
    ));

    let app = orbitd::http::router(server);
    let listener = tokio::net::TcpListener::bind(opts.bind)
        .await
        .map_err(|e| err(format!("binding {}: {e}", opts.bind)))?;

    let serve_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            serve_cancel.cancel();
        })
        .await
        .map_err(|e| err(format!("http server error: {e}")))?;

    cancel.cancel();
    let _ = engine_task.await;
    let _ = sweep_task.await;
    let _ = liveness_task.await;
    Ok(())
}
