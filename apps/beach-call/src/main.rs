use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use beach_call::{
    cli::Cli,
    config::Config,
    media::KurentoMediaServer,
    router,
    telemetry::Telemetry,
    websocket::{spawn_heartbeat_monitor, SignalingState},
    CallCoordinator, ConnectionHub,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = Config::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        media_server_url = %config.media_server_url,
        "starting beach-call server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: Config, metrics: PrometheusHandle) -> Result<()> {
    // Connects on first use; an unreachable server surfaces per call.
    let media = Arc::new(KurentoMediaServer::new(
        config.media_server_url.clone(),
        config.media_rpc_timeout,
    ));
    let coordinator = Arc::new(CallCoordinator::new(media, ConnectionHub::new()));
    let monitor = spawn_heartbeat_monitor(
        coordinator.clone(),
        config.heartbeat_interval,
        config.heartbeat_timeout,
    );

    let app = router(
        SignalingState::new(coordinator)
            .with_metrics(metrics)
            .with_ping_interval(config.heartbeat_interval),
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-call listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    monitor.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
