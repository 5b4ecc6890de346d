//! Durable store: the system of record
//!
//! Every write is an upsert keyed by entity id and guarded by the job
//! version, so replays are harmless and out-of-order delivery converges on
//! the newest submission. Deletes leave a versioned tombstone.

pub mod memory;
pub mod mongo;
pub mod schemas;

pub use memory::MemoryStore;
pub use mongo::{MongoClient, MongoStore};

use async_trait::async_trait;

use crate::entity::Fields;
use crate::types::Result;

/// Outcome of a versioned write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWrite {
    /// The write changed the stored entity
    Applied,
    /// The stored entity already carries this version or a newer one
    Stale,
}

/// Durable store adapter
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or fully replace the entity
    async fn create(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        version: u64,
    ) -> Result<StoreWrite>;

    /// Write `fields` onto the entity, inserting it if absent
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        version: u64,
    ) -> Result<StoreWrite>;

    /// Tombstone the entity
    async fn delete(&self, collection: &str, id: &str, version: u64) -> Result<StoreWrite>;

    /// Live (non-deleted) entity without store metadata
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>>;

    /// Short backend name for status reporting
    fn backend(&self) -> &'static str;
}
