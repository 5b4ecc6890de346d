//! Reconciliation workers
//!
//! Workers take durable write jobs off the queue and apply them to the
//! durable store, retrying with backoff and dead-lettering jobs that keep
//! failing.
//!
//! Two drivers exist:
//! - [`WorkerPool`]: in-process, single-node. Also the [`WriteQueue`] used
//!   when no NATS server is configured.
//! - [`Worker`]: JetStream pull consumer, run by the `feedline-worker` binary.
//!
//! [`WriteQueue`]: crate::queue::WriteQueue

pub mod pool;
pub mod processor;
pub mod reconciler;

pub use pool::{PoolConfig, WorkerPool};
pub use processor::{Worker, WorkerConfig};
pub use reconciler::{DeadLetter, DeadLetters, Reconciler};
