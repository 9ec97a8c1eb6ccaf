//! Public IP lookup of the host itself, reported on `/health`.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct IpResponse {
    ip: IpAddr,
}

/// Ask `url` for this host's public address. Expects `{"ip": "..."}`.
pub async fn lookup(client: &reqwest::Client, url: &str) -> Result<IpAddr> {
    let response = client
        .get(url)
        .timeout(LOOKUP_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::PublicIp(e.to_string()))?;

    if !response.status().is_success() {
        return Err(Error::PublicIp(format!(
            "{url} returned {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::PublicIp(e.to_string()))?;
    let body: IpResponse = serde_json::from_slice(&bytes)
        .map_err(|e| Error::PublicIp(format!("unexpected response from {url}: {e}")))?;
    info!(ip = %body.ip, "public IP resolved");
    Ok(body.ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::net::TcpListener;

    async fn serve(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/?format=json")
    }

    #[tokio::test]
    async fn parses_ipify_response() {
        let url = serve(axum::Router::new().route(
            "/",
            get(|| async { axum::Json(serde_json::json!({"ip": "203.0.113.7"})) }),
        ))
        .await;
        let ip = lookup(&reqwest::Client::new(), &url).await.unwrap();
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn error_status_is_public_ip_error() {
        let url = serve(axum::Router::new().route(
            "/",
            get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let err = lookup(&reqwest::Client::new(), &url).await.unwrap_err();
        assert!(err.to_string().contains("503"), "got: {err}");
    }

    #[tokio::test]
    async fn garbage_body_is_public_ip_error() {
        let url = serve(axum::Router::new().route("/", get(|| async { "not json" }))).await;
        assert!(matches!(
            lookup(&reqwest::Client::new(), &url).await,
            Err(Error::PublicIp(_))
        ));
    }
}
