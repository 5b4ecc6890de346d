//! feedline - write path for a social feed backend
//!
//! Every mutation is applied to a fast in-memory cache first, broadcast to
//! connected WebSocket clients, then queued for eventual persistence.
//!
//! ## Components
//!
//! - **Cache**: in-memory materialized view, the read-your-own-write source
//! - **Broadcast**: live fan-out to subscribers, optionally relayed over NATS
//! - **Queue**: durable write jobs on NATS JetStream or an in-process pool
//! - **Worker**: reconciles jobs into MongoDB with retries and dead letters
//! - **Coordinator**: runs cache write, broadcast and enqueue in fixed order

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod entity;
pub mod logging;
pub mod nats;
pub mod queue;
pub mod routes;
pub mod server;
pub mod types;
pub mod worker;

pub use config::Args;
pub use coordinator::{CoordinatorConfig, MutationCoordinator, Services};
pub use server::{run, AppState};
pub use types::{FeedError, Result};
