//! JetStream-backed write queue
//!
//! Jobs are published to `feed.writes.<kind>` on the `FEED_WRITES` stream
//! (file storage, work-queue retention), so they survive a restart of the
//! enqueuing process. Dead letters land on `FEED_DEAD`.

use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::{self, stream::Stream};
use async_nats::HeaderMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::job::{DEAD_SUBJECT_PREFIX, WRITE_SUBJECT_PREFIX};
use super::{RetryPolicy, WriteJob, WriteQueue};
use crate::nats::NatsClient;
use crate::types::{FeedError, Result};

pub const STREAM_NAME: &str = "FEED_WRITES";
pub const DEAD_STREAM_NAME: &str = "FEED_DEAD";

/// Publisher-side settings
#[derive(Debug, Clone)]
pub struct JetStreamQueueConfig {
    /// Bound on one publish including its ack
    pub enqueue_timeout: Duration,
    /// Retries for transient publish failures
    pub retry: RetryPolicy,
}

impl Default for JetStreamQueueConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(2),
            retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(500)),
        }
    }
}

/// Ensure both the work stream and the dead-letter stream exist.
///
/// Returns the work stream.
pub async fn ensure_streams(js: &jetstream::Context) -> Result<Stream> {
    let stream = js
        .get_or_create_stream(jetstream::stream::Config {
            name: STREAM_NAME.to_string(),
            subjects: vec![format!("{}.>", WRITE_SUBJECT_PREFIX)],
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            storage: jetstream::stream::StorageType::File,
            duplicate_window: Duration::from_secs(120),
            ..Default::default()
        })
        .await
        .map_err(|e| FeedError::Nats(format!("Failed to create stream: {e}")))?;

    js.get_or_create_stream(jetstream::stream::Config {
        name: DEAD_STREAM_NAME.to_string(),
        subjects: vec![format!("{}.>", DEAD_SUBJECT_PREFIX)],
        storage: jetstream::stream::StorageType::File,
        ..Default::default()
    })
    .await
    .map_err(|e| FeedError::Nats(format!("Failed to create dead-letter stream: {e}")))?;

    info!(
        "Using stream {} with subjects {}.>",
        STREAM_NAME, WRITE_SUBJECT_PREFIX
    );
    Ok(stream)
}

/// Write queue publishing to JetStream
pub struct JetStreamQueue {
    jetstream: jetstream::Context,
    config: JetStreamQueueConfig,
}

impl JetStreamQueue {
    pub async fn new(nats: &NatsClient, config: JetStreamQueueConfig) -> Result<Self> {
        let jetstream = nats.jetstream();
        ensure_streams(&jetstream).await?;
        Ok(Self { jetstream, config })
    }

    async fn publish_once(&self, job: &WriteJob, payload: &[u8]) -> Result<()> {
        // Same id on every retry lets the stream drop duplicates
        let mut headers = HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, job.job_id.to_string().as_str());

        let ack = self
            .jetstream
            .publish_with_headers(job.subject(), headers, payload.to_vec().into())
            .await
            .map_err(|e| FeedError::QueueUnavailable(format!("Publish failed: {e}")))?;

        ack.await
            .map_err(|e| FeedError::QueueUnavailable(format!("Publish not acknowledged: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl WriteQueue for JetStreamQueue {
    async fn enqueue(&self, job: WriteJob) -> Result<()> {
        let payload = job.to_bytes()?;
        let policy = self.config.retry;
        let mut attempt = 1;

        loop {
            let outcome = tokio::time::timeout(
                self.config.enqueue_timeout,
                self.publish_once(&job, &payload),
            )
            .await
            .unwrap_or_else(|_| Err(FeedError::QueueUnavailable("Publish timed out".into())));

            match outcome {
                Ok(()) => {
                    debug!(job = job.name(), key = job.key(), version = job.version, "Job enqueued");
                    return Ok(());
                }
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        job = job.name(),
                        key = job.key(),
                        attempt = attempt,
                        error = %e,
                        "Enqueue failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backend(&self) -> &'static str {
        "jetstream"
    }
}
