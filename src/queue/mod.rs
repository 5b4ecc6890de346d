//! Durable write queue
//!
//! Jobs carry the full post-mutation state of one entity. Acceptance by
//! [`WriteQueue::enqueue`] means the job is stored by the queue and will be
//! delivered at least once to a reconciliation worker.

pub mod jetstream;
pub mod job;
pub mod retry;

pub use jetstream::JetStreamQueue;
pub use job::{next_version, WriteJob, WriteOp};
pub use retry::RetryPolicy;

use async_trait::async_trait;

use crate::types::Result;

/// Durable write queue adapter.
///
/// Failures surface as `FeedError::QueueUnavailable`.
#[async_trait]
pub trait WriteQueue: Send + Sync {
    async fn enqueue(&self, job: WriteJob) -> Result<()>;

    /// Short backend name for status reporting
    fn backend(&self) -> &'static str;
}
