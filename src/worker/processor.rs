//! JetStream reconciliation worker
//!
//! Pulls write jobs from the `FEED_WRITES` stream through one shared durable
//! consumer, so any number of worker processes split the load. Failed jobs
//! are nak'ed with a backoff delay and redelivered; after the last attempt
//! they are published to `feed.dead.<kind>` and terminated.

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream, AckKind};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::reconciler::{DeadLetter, Reconciler};
use crate::nats::NatsClient;
use crate::queue::jetstream::{ensure_streams, STREAM_NAME};
use crate::queue::job::WRITE_SUBJECT_PREFIX;
use crate::queue::{RetryPolicy, WriteJob};
use crate::types::{FeedError, Result};

/// Durable consumer shared by every worker process
pub const CONSUMER_NAME: &str = "feed_reconciler";

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Messages fetched per pull
    pub batch_size: usize,
    /// How long the server waits for an ack before redelivering
    pub ack_wait: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            batch_size: 32,
            ack_wait: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Backend worker draining the write stream into the durable store
pub struct Worker {
    config: WorkerConfig,
    jetstream: jetstream::Context,
    reconciler: Reconciler,
    running: Arc<RwLock<bool>>,
    applied: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Worker {
    pub fn new(nats: &NatsClient, reconciler: Reconciler, config: WorkerConfig) -> Self {
        info!("Creating worker {}", config.worker_id);
        Self {
            config,
            jetstream: nats.jetstream(),
            reconciler,
            running: Arc::new(RwLock::new(false)),
            applied: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Run the worker processing loop until [`Worker::stop`] is called
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;

        let stream = ensure_streams(&self.jetstream).await?;
        let consumer = self.ensure_consumer(&stream).await?;

        info!("Worker {} starting job processing loop", self.config.worker_id);

        while *self.running.read().await {
            match self.process_batch(&consumer).await {
                Ok(count) => {
                    if count > 0 {
                        debug!("Processed {} jobs", count);
                    }
                }
                Err(e) => {
                    error!("Error processing batch: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(
            "Worker {} stopped ({} applied, {} dead-lettered)",
            self.config.worker_id,
            self.applied.load(Ordering::Relaxed),
            self.dead_lettered.load(Ordering::Relaxed)
        );
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    async fn ensure_consumer(&self, stream: &Stream) -> Result<PullConsumer> {
        let consumer = stream
            .get_or_create_consumer(
                CONSUMER_NAME,
                jetstream::consumer::pull::Config {
                    durable_name: Some(CONSUMER_NAME.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: format!("{WRITE_SUBJECT_PREFIX}.>"),
                    ack_wait: self.config.ack_wait,
                    max_ack_pending: (self.config.batch_size * 4) as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| FeedError::Nats(format!("Failed to create consumer: {e}")))?;

        info!("Using consumer {} on stream {}", CONSUMER_NAME, STREAM_NAME);
        Ok(consumer)
    }

    async fn process_batch(&self, consumer: &PullConsumer) -> Result<usize> {
        let mut messages = consumer
            .fetch()
            .max_messages(self.config.batch_size)
            .expires(Duration::from_secs(5))
            .messages()
            .await
            .map_err(|e| FeedError::Nats(format!("Failed to fetch messages: {e}")))?;

        let mut count = 0;

        while let Some(msg_result) = messages.next().await {
            match msg_result {
                Ok(msg) => {
                    count += 1;
                    self.process_message(msg).await;
                }
                Err(e) => {
                    warn!("Error receiving message: {}", e);
                }
            }
        }

        Ok(count)
    }

    async fn process_message(&self, msg: jetstream::Message) {
        let job = match WriteJob::from_bytes(&msg.payload) {
            Ok(job) => job,
            Err(e) => {
                // Redelivery cannot fix a payload that does not parse
                error!("Dropping malformed job on {}: {}", msg.subject, e);
                if let Err(e) = msg.ack_with(AckKind::Term).await {
                    warn!("Failed to terminate malformed message: {}", e);
                }
                return;
            }
        };

        let attempt = msg
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1);

        let error = match self.reconciler.apply(&job).await {
            Ok(_) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = msg.ack().await {
                    warn!("Failed to ack job {}: {}", job.job_id, e);
                }
                return;
            }
            Err(e) => e,
        };

        let policy = &self.config.retry;
        if policy.should_retry(attempt) {
            let delay = policy.delay(attempt);
            warn!(
                job = job.name(),
                key = job.key(),
                attempt = attempt,
                error = %error,
                "Durable write failed, redelivering in {:?}",
                delay
            );
            if let Err(e) = msg.ack_with(AckKind::Nak(Some(delay))).await {
                warn!("Failed to nak job {}: {}", job.job_id, e);
            }
            return;
        }

        let failure = FeedError::DurableWriteFailed(format!(
            "{} {} after {} attempts: {}",
            job.name(),
            job.key(),
            attempt,
            error
        ));
        let dead_subject = job.dead_subject();
        let letter = DeadLetter::new(job, failure.to_string(), attempt);

        if let Err(e) = self.publish_dead_letter(&dead_subject, &letter).await {
            // Leave it unacked so ack_wait brings it back rather than losing it
            error!("Failed to dead-letter job {}: {}", letter.job.job_id, e);
            return;
        }

        error!(
            job = letter.job.name(),
            key = letter.job.key(),
            job_id = %letter.job.job_id,
            attempts = attempt,
            error = %letter.error,
            "Job dead-lettered to {}",
            dead_subject
        );
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = msg.ack_with(AckKind::Term).await {
            warn!("Failed to terminate job {}: {}", letter.job.job_id, e);
        }
    }

    async fn publish_dead_letter(&self, subject: &str, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_vec(letter)?;
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| FeedError::Nats(format!("Dead-letter publish failed: {e}")))?
            .await
            .map_err(|e| FeedError::Nats(format!("Dead-letter not acknowledged: {e}")))?;
        Ok(())
    }
}
