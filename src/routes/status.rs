//! Runtime status endpoint

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub mode: &'static str,
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_time: &'static str,
    pub uptime: u64,
    pub queue_backend: &'static str,
    pub store_backend: &'static str,
    pub relay_active: bool,
    pub cache: CacheStatus,
    pub websocket: WebSocketStatus,
    /// Jobs dead-lettered by the in-process pool
    pub dead_letters: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pool: Option<PoolStatus>,
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct WebSocketStatus {
    pub connected: usize,
    pub published: u64,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub workers: usize,
    pub processed: u64,
}

pub fn build_status(state: &AppState) -> StatusResponse {
    let stats = state.cache.stats();
    StatusResponse {
        node_id: state.args.node_id.to_string(),
        mode: if state.args.dev_mode { "development" } else { "production" },
        version: env!("CARGO_PKG_VERSION"),
        git_commit: env!("GIT_COMMIT_SHORT"),
        build_time: env!("BUILD_TIMESTAMP"),
        uptime: state.started_at.elapsed().as_secs(),
        queue_backend: state.services.queue.backend(),
        store_backend: state.store_backend,
        relay_active: state.relay_active,
        cache: CacheStatus {
            entries: stats.entries,
            max_entries: state.cache.config().max_entries,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            hit_rate: stats.hit_rate(),
        },
        websocket: WebSocketStatus {
            connected: state.hub.connected_count(),
            published: state.hub.published_count(),
        },
        dead_letters: state.dead_letters.len(),
        worker_pool: state.pool.as_ref().map(|pool| PoolStatus {
            workers: pool.worker_count(),
            processed: pool.processed_count(),
        }),
    }
}

pub fn status_check(state: &AppState) -> Response<Full<Bytes>> {
    let json_body = serde_json::to_string(&build_status(state)).unwrap_or_else(|_| "{}".into());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Cache-Control", "no-store")
        .body(Full::new(Bytes::from(json_body)))
        .unwrap()
}
