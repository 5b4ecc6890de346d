//! feedline-worker - JetStream reconciliation worker
//!
//! Drains durable write jobs from the `FEED_WRITES` stream into MongoDB.
//! Run as many as needed; they share one durable consumer.
//!
//! Usage:
//!   feedline-worker --nats-url nats://localhost:4222 --mongodb-uri mongodb://localhost:27017
//!
//! Environment variables:
//!   NATS_URL - NATS server URL (default: nats://127.0.0.1:4222)
//!   MONGODB_URI - MongoDB connection URI (default: mongodb://localhost:27017)
//!   MONGODB_DB - Database name (default: feedline)
//!   WORKER_ID - Unique worker identifier (default: auto-generated UUID)
//!   BATCH_SIZE - Messages fetched per pull (default: 32)
//!   MAX_ATTEMPTS - Deliveries before dead-lettering (default: 5)
//!   RETRY_BASE_MS / RETRY_MAX_MS - Redelivery backoff bounds

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use feedline::config::{validate_retry, LogFormat, NatsArgs};
use feedline::db::{MongoClient, MongoStore};
use feedline::logging;
use feedline::nats::NatsClient;
use feedline::queue::RetryPolicy;
use feedline::worker::{Reconciler, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "feedline-worker")]
#[command(about = "Reconciliation worker persisting feedline write jobs")]
#[command(version)]
struct Args {
    #[command(flatten)]
    nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "feedline")]
    mongodb_db: String,

    /// Unique worker ID (auto-generated if not provided)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Messages fetched per pull
    #[arg(long, env = "BATCH_SIZE", default_value = "32")]
    batch_size: usize,

    /// Deliveries before a job is dead-lettered
    #[arg(long, env = "MAX_ATTEMPTS", default_value = "5")]
    max_attempts: u32,

    /// First redelivery delay (ms)
    #[arg(long, env = "RETRY_BASE_MS", default_value = "200")]
    retry_base_ms: u64,

    /// Redelivery delay ceiling (ms)
    #[arg(long, env = "RETRY_MAX_MS", default_value = "30000")]
    retry_max_ms: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_format);

    if let Err(e) = validate_retry(args.max_attempts, args.retry_base_ms, args.retry_max_ms) {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = WorkerConfig {
        worker_id: args
            .worker_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        batch_size: args.batch_size.max(1),
        retry: RetryPolicy::new(
            args.max_attempts,
            Duration::from_millis(args.retry_base_ms),
            Duration::from_millis(args.retry_max_ms),
        ),
        ..Default::default()
    };

    info!(
        "Starting feedline worker {} (NATS: {}, MongoDB: {})",
        config.worker_id, args.nats.nats_url, args.mongodb_uri
    );

    let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    let nats = NatsClient::new(&args.nats, &format!("feedline-worker-{}", config.worker_id)).await?;

    let worker = Arc::new(Worker::new(
        &nats,
        Reconciler::new(Arc::new(MongoStore::new(mongo))),
        config,
    ));

    let runner = Arc::clone(&worker);
    let mut worker_handle = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Worker error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            worker.stop().await;
            // Let the in-flight batch finish
            if tokio::time::timeout(Duration::from_secs(10), &mut worker_handle).await.is_err() {
                error!("Worker did not stop in time");
            }
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!("Worker task error: {}", e);
            }
        }
    }

    info!("Worker shutting down");
    Ok(())
}
