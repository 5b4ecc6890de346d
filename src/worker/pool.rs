//! In-process worker pool
//!
//! Single-node replacement for the JetStream queue:
//! - Fixed set of worker tasks, each owning a bounded channel
//! - Jobs for one entity key always land on the same worker, so they are
//!   applied in submission order
//! - Enqueue waits a bounded time for channel capacity
//!
//! Jobs live only in memory; a process restart loses whatever is queued.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::reconciler::{DeadLetter, DeadLetters, Reconciler};
use crate::queue::{RetryPolicy, WriteJob, WriteQueue};
use crate::types::{FeedError, Result};

enum PoolMessage {
    Job(WriteJob),
    /// Answered once every message queued before it has been handled
    Flush(oneshot::Sender<()>),
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// Per-worker channel capacity
    pub queue_capacity: usize,
    /// How long enqueue waits for capacity before giving up
    pub enqueue_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1000,
            enqueue_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// In-process reconciliation pool, usable as a [`WriteQueue`]
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<PoolMessage>>,
    enqueue_timeout: Duration,
    dead_letters: Arc<DeadLetters>,
    processed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawn the worker tasks
    pub fn start(config: PoolConfig, reconciler: Reconciler, dead_letters: Arc<DeadLetters>) -> Self {
        let worker_count = config.worker_count.max(1);
        let processed = Arc::new(AtomicU64::new(0));

        info!(
            "Starting worker pool with {} workers (capacity {} each)",
            worker_count, config.queue_capacity
        );

        let senders = (0..worker_count)
            .map(|i| {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                tokio::spawn(worker_task(
                    i,
                    rx,
                    reconciler.clone(),
                    config.retry,
                    Arc::clone(&dead_letters),
                    Arc::clone(&processed),
                ));
                tx
            })
            .collect();

        Self {
            senders,
            enqueue_timeout: config.enqueue_timeout,
            dead_letters,
            processed,
        }
    }

    fn route(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Wait until every job enqueued so far has been handled
    pub async fn flush(&self) {
        for sender in &self.senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(PoolMessage::Flush(tx)).await.is_ok() {
                let _ = rx.await;
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Jobs handled so far, applied or dead-lettered
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetters> {
        &self.dead_letters
    }
}

#[async_trait::async_trait]
impl WriteQueue for WorkerPool {
    async fn enqueue(&self, job: WriteJob) -> Result<()> {
        let sender = &self.senders[self.route(job.key())];
        match tokio::time::timeout(self.enqueue_timeout, sender.send(PoolMessage::Job(job))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(FeedError::QueueUnavailable("Worker pool closed".into())),
            Err(_) => Err(FeedError::QueueUnavailable("Worker pool queue full".into())),
        }
    }

    fn backend(&self) -> &'static str {
        "pool"
    }
}

async fn worker_task(
    worker_id: usize,
    mut rx: mpsc::Receiver<PoolMessage>,
    reconciler: Reconciler,
    retry: RetryPolicy,
    dead_letters: Arc<DeadLetters>,
    processed: Arc<AtomicU64>,
) {
    debug!("Pool worker {} started", worker_id);

    while let Some(message) = rx.recv().await {
        match message {
            PoolMessage::Job(job) => {
                match reconciler.apply_with_retry(&job, &retry).await {
                    Ok(write) => {
                        debug!(worker = worker_id, job = job.name(), key = job.key(), ?write, "Job done");
                    }
                    Err(e) => {
                        dead_letters.record(DeadLetter::new(job, e.to_string(), retry.max_attempts));
                    }
                }
                processed.fetch_add(1, Ordering::Relaxed);
            }
            PoolMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    info!("Pool worker {} shutting down (channel closed)", worker_id);
}
