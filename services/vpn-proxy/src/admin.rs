//! Admin API
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is never served
//! on the proxy port, where every path is forwarded.
//!
//! Endpoints:
//! - GET  /health                  pool status, uptime, public IP
//! - GET  /metrics                 Prometheus exposition
//! - GET  /admin/slots             every slot with its state and tunnel
//! - POST /admin/slots/{key}/renew re-admit a slot by renewing its tunnel

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use egress_pool::{RenewalWorker, SlotRegistry};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::metrics;
use crate::service::ServiceMetrics;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub worker: Arc<RenewalWorker>,
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
    /// Public address of this host, if the lookup succeeded.
    pub public_ip: Option<IpAddr>,
}

impl AdminState {
    fn registry(&self) -> &SlotRegistry {
        self.worker.registry()
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/admin/slots", get(list_slots))
        .route("/admin/slots/{key}/renew", post(renew_slot))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /health: 200 while any slot is ready, 503 otherwise.
async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let mut body = state.registry().health();
    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    if let Some(fields) = body.as_object_mut() {
        fields.insert(
            "uptime_seconds".into(),
            state.metrics.started_at.elapsed().as_secs().into(),
        );
        fields.insert(
            "requests_served".into(),
            state.metrics.requests_total.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "errors_total".into(),
            state.metrics.errors_total.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "renewals_in_flight".into(),
            state.worker.in_flight().into(),
        );
        fields.insert(
            "public_ip".into(),
            state
                .public_ip
                .map_or(serde_json::Value::Null, |ip| ip.to_string().into()),
        );
    }

    json(status_code, body)
}

/// GET /metrics: slot gauges are refreshed on every scrape.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    metrics::record_pool(state.registry());
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET /admin/slots
async fn list_slots(State(state): State<AdminState>) -> impl IntoResponse {
    json(
        StatusCode::OK,
        serde_json::json!({ "slots": state.registry().snapshot() }),
    )
}

/// POST /admin/slots/{key}/renew
///
/// Accepts any slot that is not already renewing, including `Ready` ones,
/// which forces a fresh tunnel. The renewal runs in the background.
async fn renew_slot(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let Some(slot) = state.registry().get(&key) else {
        return json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("slot not found: {key}") }),
        );
    };
    if slot.renewing {
        return json(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": format!("slot {key} is already renewing") }),
        );
    }

    info!(slot = %key, previous = slot.status.label(), "manual renewal requested");
    state.worker.spawn(key.clone());
    json(
        StatusCode::ACCEPTED,
        serde_json::json!({ "slot": key, "status": "renewal_started" }),
    )
}
