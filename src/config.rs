//! Configuration for feedline
//!
//! CLI arguments with environment variable fallbacks using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::coordinator::CoordinatorConfig;
use crate::queue::RetryPolicy;
use crate::worker::PoolConfig;

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// feedline - cache-first write path for a social feed
#[derive(Parser, Debug, Clone)]
#[command(name = "feedline")]
#[command(about = "Social feed backend: cache first, broadcast live, persist eventually")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Development mode: MongoDB and NATS become optional
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "feedline")]
    pub mongodb_db: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Bound on the cache write and on the enqueue of one mutation (ms)
    #[arg(long, env = "STEP_TIMEOUT_MS", default_value = "5000")]
    pub step_timeout_ms: u64,

    /// In-process reconciliation workers (pool queue only)
    #[arg(long, env = "WORKER_COUNT", default_value = "4")]
    pub worker_count: usize,

    /// Per-worker job capacity (pool queue only)
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "1000")]
    pub queue_capacity: usize,

    /// Attempts per durable write before dead-lettering
    #[arg(long, env = "MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: u32,

    /// First retry delay (ms)
    #[arg(long, env = "RETRY_BASE_MS", default_value = "200")]
    pub retry_base_ms: u64,

    /// Retry delay ceiling (ms)
    #[arg(long, env = "RETRY_MAX_MS", default_value = "30000")]
    pub retry_max_ms: u64,

    /// Mirror broadcasts to other instances over NATS
    #[arg(long, env = "RELAY_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub relay_enabled: bool,

    /// Endpoint receiving raw image uploads
    #[arg(long, env = "MEDIA_UPLOAD_URL")]
    pub media_upload_url: Option<String>,
}

impl Args {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            step_timeout: self.step_timeout(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            enqueue_timeout: self.step_timeout(),
            retry: self.retry_policy(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("WORKER_COUNT must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("QUEUE_CAPACITY must be at least 1".to_string());
        }
        validate_retry(self.max_attempts, self.retry_base_ms, self.retry_max_ms)?;
        if self.step_timeout_ms == 0 {
            return Err("STEP_TIMEOUT_MS must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Shared retry checks for the server and worker binaries
pub fn validate_retry(max_attempts: u32, base_ms: u64, max_ms: u64) -> Result<(), String> {
    if max_attempts == 0 {
        return Err("MAX_ATTEMPTS must be at least 1".to_string());
    }
    if base_ms > max_ms {
        return Err("RETRY_BASE_MS must be less than or equal to RETRY_MAX_MS".to_string());
    }
    Ok(())
}

/// NATS connection arguments
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}
