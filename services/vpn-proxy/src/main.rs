//! vpn-proxy: HTTP proxy that spreads requests over a pool of VPN tunnels.
//!
//! Each slot is a container running an HTTP proxy behind a VPN tunnel. After
//! a configured number of requests a slot is taken out of rotation and its
//! tunnel is re-established with the next file of its vendor, so the egress
//! address keeps changing.

mod admin;
mod completion;
mod config;
mod error;
mod metrics;
mod proxy;
mod public_ip;
mod service;
#[cfg(test)]
mod testing;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use egress_pool::{
    AvailabilityGate, Dispatcher, DockerCli, FileCatalog, PoolOrchestrator, RenewalWorker,
    SlotRegistry, TcpChannelFactory, TeardownReport, VendorStats, spawn_recovery_task,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnel_control::ChannelSettings;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::{ProxyState, SlotClients};
use crate::service::{ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event};

/// Build the proxy router: every request goes to the fallback handler.
fn build_router(state: ProxyState, max_connections: usize) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting vpn-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let vendors = config.vendor_specs()?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        admin_addr = %config.admin.listen_addr,
        image = %config.pool.image,
        request_limit = config.pool.request_limit,
        vendors = vendors.iter().filter(|v| v.enabled).count(),
        credentials = config.pool.credentials.is_some(),
        "configuration loaded"
    );

    let signalled = watch_shutdown_signal();

    let orchestrator = PoolOrchestrator::new(
        Arc::new(DockerCli::default()),
        Arc::new(TcpChannelFactory::new(ChannelSettings::default())),
        Arc::new(FileCatalog::new(&config.pool.tunnel_dir)),
        Arc::new(SlotRegistry::new()),
        config.pool_settings(),
    );

    // Transition: Initializing -> ClearingStale
    let (new_state, action) = handle_event(state, ServiceEvent::ConfigLoaded);
    state = new_state;
    if action != ServiceAction::ClearStale {
        anyhow::bail!("unexpected action after ConfigLoaded: {action:?}");
    }
    log_teardown("stale", &orchestrator.tear_down().await);

    // Transition: ClearingStale -> BringingUp
    let (new_state, action) = handle_event(state, startup_event(&signalled, ServiceEvent::StaleCleared));
    state = new_state;
    if action == ServiceAction::TearDown {
        return finish(state, &orchestrator, None, None).await;
    }

    let keys = tokio::select! {
        keys = orchestrator.bring_up(&vendors) => keys.context("pool bring-up failed")?,
        _ = shutdown_requested(signalled.clone()) => {
            let (state, _) = handle_event(state, ServiceEvent::ShutdownSignal);
            return finish(state, &orchestrator, None, None).await;
        }
    };

    // Transition: BringingUp -> Starting (or TearingDown with no slots)
    let (new_state, action) = handle_event(state, ServiceEvent::PoolUp { slots: keys.len() });
    state = new_state;
    if action == ServiceAction::TearDown {
        error!("no pool slot could be started");
        return finish(state, &orchestrator, None, None).await;
    }
    info!(slots = keys.len(), "state: Starting");

    let registry = orchestrator.registry().clone();
    let worker = RenewalWorker::new(
        registry.clone(),
        orchestrator.catalog().clone(),
        Arc::new(VendorStats::new()),
        config.retry_policy(),
        Duration::from_secs(config.pool.connect_timeout_secs),
    );
    worker.activate_all();

    let recovery = (config.pool.recovery_interval_secs > 0).then(|| {
        spawn_recovery_task(
            worker.clone(),
            Duration::from_secs(config.pool.recovery_interval_secs),
        )
    });

    let public_ip = lookup_public_ip(&config.proxy.public_ip_url).await;
    let metrics = ServiceMetrics::new();

    let listeners = async {
        let clients = SlotClients::build(&registry).context("failed to build slot clients")?;
        let proxy_listener = TcpListener::bind(config.proxy.listen_addr)
            .await
            .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;
        let admin_listener = TcpListener::bind(config.admin.listen_addr)
            .await
            .with_context(|| format!("failed to bind admin to {}", config.admin.listen_addr))?;
        anyhow::Ok((clients, proxy_listener, admin_listener))
    };
    let (clients, proxy_listener, admin_listener) = match listeners.await {
        Ok(bound) => bound,
        Err(e) => {
            let (state, _) = handle_event(state, ServiceEvent::ShutdownSignal);
            finish(state, &orchestrator, Some(&worker), recovery).await?;
            return Err(e);
        }
    };

    let proxy_state = ProxyState {
        dispatcher: Arc::new(Dispatcher::new(
            AvailabilityGate::new(registry.clone()),
            worker.clone(),
            config.pool.request_limit,
        )),
        clients: Arc::new(clients),
        timeout: Duration::from_secs(config.proxy.timeout_secs),
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };
    let admin_state = AdminState {
        worker: worker.clone(),
        metrics: metrics.clone(),
        prometheus,
        public_ip,
    };

    let app = build_router(proxy_state, config.proxy.max_connections);
    let admin_app = build_admin_router(admin_state);

    // Both servers stop accepting as soon as the signal fires.
    let proxy_server = tokio::spawn({
        let signalled = signalled.clone();
        async move {
            axum::serve(proxy_listener, app)
                .with_graceful_shutdown(shutdown_requested(signalled))
                .await
        }
    });
    let admin_server = tokio::spawn({
        let signalled = signalled.clone();
        async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(shutdown_requested(signalled))
                .await
        }
    });

    // Transition: Starting -> Running
    let (new_state, _) = handle_event(state, ServiceEvent::ListenersReady);
    state = new_state;
    info!(
        addr = %config.proxy.listen_addr,
        admin_addr = %config.admin.listen_addr,
        "state: Running, accepting requests"
    );

    shutdown_requested(signalled).await;

    // Transition: Running -> Draining
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let ServiceAction::Drain { deadline } = action else {
        anyhow::bail!("unexpected action after ShutdownSignal: {action:?}");
    };

    // The drain timer starts at signal receipt, not at server start.
    let drained = tokio::time::timeout_at(deadline.into(), proxy_server).await;
    let event = match drained {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            warn!(
                remaining = metrics.in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = service::DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };
    admin_server.abort();

    // Transition: Draining -> TearingDown
    let (state, _) = handle_event(state, event);
    finish(state, &orchestrator, Some(&worker), recovery).await
}

/// Abandon background work, remove every pool instance, and exit.
async fn finish(
    state: ServiceState,
    orchestrator: &PoolOrchestrator,
    worker: Option<&Arc<RenewalWorker>>,
    recovery: Option<JoinHandle<()>>,
) -> Result<()> {
    if let Some(recovery) = recovery {
        recovery.abort();
    }
    if let Some(worker) = worker {
        worker.shutdown();
    }

    if matches!(state, ServiceState::TearingDown { .. }) {
        info!("state: TearingDown");
        log_teardown("pool", &orchestrator.tear_down().await);
    }

    let (state, action) = handle_event(state, ServiceEvent::TornDown);
    info!(?state, "shutdown complete");
    match action {
        ServiceAction::Exit { code: 0 } => Ok(()),
        ServiceAction::Exit { .. } => Err(error::Error::NoUsableSlots.into()),
        _ => anyhow::bail!("unexpected action after TornDown: {action:?}"),
    }
}

fn log_teardown(what: &str, report: &TeardownReport) {
    if !report.removed.is_empty() {
        info!(what, removed = report.removed.len(), "instances removed");
    }
    for (instance, error) in &report.failed {
        warn!(what, instance = %instance, error = %error, "instance removal failed");
    }
}

/// Public address of this host, or `None` if disabled or the lookup failed.
async fn lookup_public_ip(url: &str) -> Option<IpAddr> {
    if url.is_empty() {
        return None;
    }
    match public_ip::lookup(&reqwest::Client::new(), url).await {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!(error = %e, "continuing without public IP");
            None
        }
    }
}

/// Catch-all handler that forwards every request through a pool slot.
async fn proxy_handler(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state, request, request_id).await
}

/// `event`, unless a shutdown signal arrived in the meantime.
fn startup_event(signalled: &watch::Receiver<bool>, event: ServiceEvent) -> ServiceEvent {
    if *signalled.borrow() {
        ServiceEvent::ShutdownSignal
    } else {
        event
    }
}

/// Resolves once the shutdown signal has been received.
async fn shutdown_requested(mut signalled: watch::Receiver<bool>) {
    if signalled.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Listen for SIGINT/SIGTERM in the background.
fn watch_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
        // Keep the sender alive so receivers never see a closed channel.
        std::future::pending::<()>().await;
    });
    rx
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
