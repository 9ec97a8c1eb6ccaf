//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `pool_slots` (gauge): label `state`, refreshed on every scrape
//! - `pool_renewals_total`, `pool_renewal_duration_seconds`: emitted by the pool

use egress_pool::SlotRegistry;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Tunnel establishment takes seconds, retries add backoff.
const RENEWAL_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];

const SLOT_STATES: [&str; 5] = ["pending", "ready", "draining", "renewing", "failed"];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            REQUEST_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("pool_renewal_duration_seconds".to_string()),
            RENEWAL_BUCKETS,
        )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Publish the number of slots in each state.
pub fn record_pool(registry: &SlotRegistry) {
    let slots = registry.snapshot();
    for state in SLOT_STATES {
        let count = slots.iter().filter(|s| s.status.label() == state).count();
        metrics::gauge!("pool_slots", "state" => state).set(count as f64);
    }
}
