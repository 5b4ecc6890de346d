//! Job dispatch onto the durable store

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::{DurableStore, StoreWrite};
use crate::entity::{EntityKind, Fields};
use crate::queue::{RetryPolicy, WriteJob, WriteOp};
use crate::types::{FeedError, Result};

/// Applies write jobs to the durable store
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn DurableStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Apply one job once
    pub async fn apply(&self, job: &WriteJob) -> Result<StoreWrite> {
        let version = job.version;
        let write = match &job.op {
            WriteOp::Create { kind, key, value } => {
                self.store.create(kind.collection(), key, value, version).await?
            }
            // The snapshot is the whole entity, so a late job never leaves
            // fields behind that a newer one removed
            WriteOp::Update { kind, key, value, .. } => {
                self.store.create(kind.collection(), key, value, version).await?
            }
            WriteOp::MarkNotificationRead { key } => {
                let mut read = Fields::new();
                read.insert("read".to_string(), Value::Bool(true));
                self.store
                    .update(EntityKind::Notification.collection(), key, &read, version)
                    .await?
            }
            WriteOp::Delete { kind, key } => {
                self.store.delete(kind.collection(), key, version).await?
            }
        };

        debug!(
            job = job.name(),
            key = job.key(),
            version = version,
            ?write,
            "Applied job"
        );
        Ok(write)
    }

    /// Apply a job, retrying per `policy`.
    ///
    /// Returns `DurableWriteFailed` once every attempt has failed.
    pub async fn apply_with_retry(&self, job: &WriteJob, policy: &RetryPolicy) -> Result<StoreWrite> {
        let mut attempt = 1;
        loop {
            match self.apply(job).await {
                Ok(write) => return Ok(write),
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        job = job.name(),
                        key = job.key(),
                        attempt = attempt,
                        error = %e,
                        "Durable write failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(FeedError::DurableWriteFailed(format!(
                        "{} {} after {} attempts: {}",
                        job.name(),
                        job.key(),
                        attempt,
                        e
                    )))
                }
            }
        }
    }
}

/// A job that exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: WriteJob,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(job: WriteJob, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            job,
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// In-process dead-letter list
#[derive(Default)]
pub struct DeadLetters {
    entries: DashMap<Uuid, DeadLetter>,
}

impl DeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, letter: DeadLetter) {
        error!(
            job = letter.job.name(),
            key = letter.job.key(),
            job_id = %letter.job.job_id,
            attempts = letter.attempts,
            error = %letter.error,
            "Job dead-lettered"
        );
        self.entries.insert(letter.job.job_id, letter);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self.entries.iter().map(|e| e.value().clone()).collect();
        letters.sort_by_key(|l| l.failed_at);
        letters
    }
}
