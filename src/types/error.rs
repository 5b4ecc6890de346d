//! Error types for feedline
//!
//! One enum covers the write path end to end. Variants map to HTTP status
//! codes so route handlers can turn any propagated error into a response.

use hyper::StatusCode;

/// Main error type for feedline operations
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Mutation targets an entity that must exist but is not cached
    #[error("Not found: {0}")]
    NotFound(String),

    /// Media collaborator rejected or failed the upload
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Fast cache unreachable; the mutation was aborted before any side effect
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Enqueue failed after the cache write and broadcast had already happened.
    /// The mutation is visible but not yet durable.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Worker gave up on a job after exhausting its retries
    #[error("Durable write failed permanently: {0}")]
    DurableWriteFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upload(_) => StatusCode::BAD_REQUEST,
            Self::CacheUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            // Degraded success: accepted and visible, durability pending
            Self::QueueUnavailable(_) => StatusCode::ACCEPTED,
            Self::DurableWriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Nats(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WebSocket(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable name used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Upload(_) => "upload_failed",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::QueueUnavailable(_) => "queue_unavailable",
            Self::DurableWriteFailed(_) => "durable_write_failed",
            Self::Database(_) => "database",
            Self::Nats(_) => "nats",
            Self::WebSocket(_) => "websocket",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the mutation still took effect in cache and broadcast
    pub fn is_degraded_success(&self) -> bool {
        matches!(self, Self::QueueUnavailable(_))
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for FeedError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<mongodb::error::Error> for FeedError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for FeedError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON encode error: {}", err))
    }
}

impl From<bson::de::Error> for FeedError {
    fn from(err: bson::de::Error) -> Self {
        Self::Database(format!("BSON decode error: {}", err))
    }
}

/// Result type alias for feedline operations
pub type Result<T> = std::result::Result<T, FeedError>;
