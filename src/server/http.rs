//! HTTP server implementation
//!
//! hyper http1 with TokioIo, one task per connection, upgrades enabled for
//! the WebSocket subscriber endpoint.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::broadcast::SocketHub;
use crate::cache::MemoryCache;
use crate::config::Args;
use crate::coordinator::{MediaUploader, MutationCoordinator, Services};
use crate::entity::{Comment, Notification, Post, Reaction};
use crate::routes;
use crate::server::websocket;
use crate::types::FeedError;
use crate::worker::{DeadLetters, WorkerPool};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Fast cache behind `services.cache`, kept concrete for stats
    pub cache: Arc<MemoryCache>,
    /// Local WebSocket hub behind `services.broadcaster`
    pub hub: Arc<SocketHub>,
    pub services: Services,
    pub uploader: Arc<dyn MediaUploader>,
    /// In-process dead letters (pool queue)
    pub dead_letters: Arc<DeadLetters>,
    /// Present when the in-process pool is the write queue
    pub pool: Option<Arc<WorkerPool>>,
    /// Durable store backend name, for status
    pub store_backend: &'static str,
    pub relay_active: bool,
    pub posts: MutationCoordinator<Post>,
    pub comments: MutationCoordinator<Comment>,
    pub reactions: MutationCoordinator<Reaction>,
    pub notifications: MutationCoordinator<Notification>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        cache: Arc<MemoryCache>,
        hub: Arc<SocketHub>,
        services: Services,
        uploader: Arc<dyn MediaUploader>,
        dead_letters: Arc<DeadLetters>,
    ) -> Self {
        let config = args.coordinator_config();
        Self {
            posts: MutationCoordinator::new(services.clone(), config.clone()),
            comments: MutationCoordinator::new(services.clone(), config.clone()),
            reactions: MutationCoordinator::new(services.clone(), config.clone()),
            notifications: MutationCoordinator::new(services.clone(), config),
            args,
            cache,
            hub,
            services,
            uploader,
            dead_letters,
            pool: None,
            store_backend: "none",
            relay_active: false,
            started_at: Instant::now(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_store_backend(mut self, backend: &'static str) -> Self {
        self.store_backend = backend;
        self
    }

    pub fn with_relay(mut self, active: bool) -> Self {
        self.relay_active = active;
        self
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), FeedError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "feedline listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - external services optional");
    }
    info!(
        "Write queue: {}, durable store: {}, broadcast relay: {}",
        state.services.queue.backend(),
        state.store_backend,
        if state.relay_active { "on" } else { "off" }
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            routes::health_check(&state)
        }

        (&Method::GET, "/status") => routes::status_check(&state),

        (&Method::GET, "/ws") => {
            websocket::handle_feed_upgrade(Arc::clone(&state), req).await
        }

        (&Method::OPTIONS, _) => preflight_response(),

        (_, p) if p.starts_with(routes::API_PREFIX) => {
            let body = match read_body(req.into_body()).await {
                Ok(body) => body,
                Err(e) => return Ok(to_boxed(routes::error_response(&e))),
            };
            match routes::dispatch(&state, &method, &path, &body).await {
                Some(response) => response,
                None => not_found_response(&path),
            }
        }

        _ => not_found_response(&path),
    };

    debug!("[{}] {} {} -> {}", addr, method, path, response.status());
    Ok(to_boxed(response))
}

/// Collect a request body, refusing it as soon as it passes `MAX_BODY_BYTES`
async fn read_body<B>(body: B) -> Result<Bytes, FeedError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(FeedError::BadRequest(format!(
            "Request body exceeds {} bytes",
            MAX_BODY_BYTES
        ))),
        Err(e) => Err(FeedError::BadRequest(format!("Failed to read request body: {}", e))),
    }
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, PATCH, DELETE, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "not_found",
        "message": format!("No route for {}", path),
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
