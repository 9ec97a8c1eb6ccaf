//! tunnel-controller: runs inside each egress instance and owns its tunnel.
//!
//! Serves the control protocol on `CONTROL_LISTEN` until SIGINT/SIGTERM, then
//! stops any running tunnel before exiting.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnel_control::{
    Controller, ControllerSettings, EstablishmentScanner, OpenVpnLauncher, serve,
};

use crate::config::Config;

fn build_controller(config: &Config) -> Result<Arc<Controller>> {
    let scanner = EstablishmentScanner::new(&config.established_pattern)
        .with_context(|| format!("invalid ESTABLISHED_PATTERN {:?}", config.established_pattern))?;
    let launcher = OpenVpnLauncher::new(&config.tunnel_binary, &config.tunnel_root);
    Ok(Controller::new(
        Arc::new(launcher),
        scanner,
        ControllerSettings::default(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env().context("failed to read controller configuration")?;
    info!(
        listen_addr = %config.listen_addr,
        tunnel_root = %config.tunnel_root.display(),
        tunnel_binary = %config.tunnel_binary.display(),
        "starting tunnel-controller"
    );

    let controller = build_controller(&config)?;
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;

    serve(listener, controller.clone(), shutdown_signal())
        .await
        .context("control listener failed")?;

    match controller.disconnect(None).await {
        Ok(exit) => info!(code = ?exit.code, signal = ?exit.signal, "tunnel stopped"),
        Err(e) => debug!(error = %e, "no tunnel to stop"),
    }
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
