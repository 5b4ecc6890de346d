//! Liveness probe
//!
//! `/health` and `/healthz` answer 200 whenever the process serves requests.
//! External services are reported on `/status`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub node_id: String,
    pub mode: &'static str,
    pub timestamp: String,
}

pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let health = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        node_id: state.args.node_id.to_string(),
        mode: if state.args.dev_mode { "development" } else { "production" },
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    let json_body = serde_json::to_string(&health).unwrap_or_else(|_| r#"{"healthy":true}"#.into());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Cache-Control", "no-store")
        .body(Full::new(Bytes::from(json_body)))
        .unwrap()
}
