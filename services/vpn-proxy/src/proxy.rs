//! HTTP forwarding through pool slots
//!
//! Every inbound request is admitted to a ready slot by the dispatcher and
//! sent through that slot's HTTP proxy (`127.0.0.1:<proxy port>`), so it
//! leaves through the slot's VPN tunnel. Hop-by-hop headers are stripped in
//! both directions. The upstream body is streamed back; the slot's ticket is
//! released when that stream ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use egress_pool::{Dispatcher, SlotRegistry};
use tracing::{debug, error, instrument, warn};

use crate::completion::TicketStream;
use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// One HTTP client per slot, each proxied through the slot's data port.
pub struct SlotClients {
    by_port: HashMap<u16, reqwest::Client>,
}

impl SlotClients {
    /// Build a client for every registered slot.
    pub fn build(registry: &SlotRegistry) -> reqwest::Result<Self> {
        let mut by_port = HashMap::new();
        for slot in registry.snapshot() {
            let proxy = reqwest::Proxy::all(format!("http://127.0.0.1:{}", slot.ports.proxy))?;
            let client = reqwest::Client::builder().proxy(proxy).build()?;
            by_port.insert(slot.ports.proxy, client);
        }
        Ok(Self { by_port })
    }

    pub fn get(&self, proxy_port: u16) -> Option<&reqwest::Client> {
        self.by_port.get(&proxy_port)
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub clients: Arc<SlotClients>,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Counts a request as in flight until the response head is produced.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Forward one inbound request through a pool slot.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), uri = %request.uri()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.in_flight);
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let response = match forward(state, request, &request_id).await {
        Ok(response) => response,
        Err(response) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            response
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// `Err` carries the error response produced by the proxy itself.
async fn forward(
    state: &ProxyState,
    request: Request<Body>,
    request_id: &str,
) -> Result<Response, Response> {
    if request.method() == Method::CONNECT {
        return Err(error_response(
            StatusCode::NOT_IMPLEMENTED,
            "CONNECT tunnelling is not supported",
            request_id,
        ));
    }

    let target = match target_url(&request) {
        Ok(target) => target,
        Err(msg) => return Err(error_response(StatusCode::BAD_REQUEST, msg, request_id)),
    };

    let method = request.method().clone();
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && *name != header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                request_id,
            ));
        }
    };

    let ticket = state.dispatcher.select().await;
    debug!(slot = ticket.key(), count = ticket.count(), target = %target, "forwarding");

    let Some(client) = state.clients.get(ticket.ports().proxy) else {
        error!(slot = ticket.key(), "no client for slot");
        return Err(error_response(
            StatusCode::BAD_GATEWAY,
            &format!("slot {} has no client", ticket.key()),
            request_id,
        ));
    };

    let result = client
        .request(method, &target)
        .headers(headers)
        .timeout(state.timeout)
        .body(body)
        .send()
        .await;

    match result {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status());
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            let body = Body::from_stream(TicketStream::new(upstream.bytes_stream(), ticket));
            response.body(body).map_err(|e| {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("response build error: {e}"),
                    request_id,
                )
            })
        }
        Err(e) if e.is_timeout() => {
            metrics::record_upstream_error("timeout");
            warn!(slot = ticket.key(), error = %e, "upstream timeout");
            Err(error_response(
                StatusCode::GATEWAY_TIMEOUT,
                &format!("upstream timeout after {}s", state.timeout.as_secs()),
                request_id,
            ))
        }
        Err(e) => {
            let kind = if e.is_connect() { "connect" } else { "request" };
            metrics::record_upstream_error(kind);
            warn!(slot = ticket.key(), error = %e, kind, "upstream request failed");
            Err(error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream error: {e}"),
                request_id,
            ))
        }
    }
}

/// Absolute URL for the outbound request.
///
/// Absolute-form request targets are used as is; origin-form targets are
/// resolved against the `Host` header.
pub fn target_url(request: &Request<Body>) -> Result<String, &'static str> {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or("request has no Host header")?;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    Ok(format!("http://{host}{path}"))
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
