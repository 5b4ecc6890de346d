//! Fast cache for the feed write path
//!
//! Holds the current materialized view of every entity the write path has
//! touched. The cache is the read-your-own-write view: once a mutation returns,
//! the cached record reflects it, even though the durable store may lag.

pub mod keys;
pub mod store;

pub use keys::CacheKey;
pub use store::{compute_etag, CacheStats, MemoryCache};

use async_trait::async_trait;

use crate::entity::{Fields, UpdateMode};
use crate::types::Result;

/// Fast cache adapter.
///
/// Implementations must make every write atomic per key and stamp it, inside
/// that atomic section, with a fresh [`next_version`]. The stamp orders the
/// durable write jobs the same way the cache writes were ordered. Any
/// connection failure surfaces as `FeedError::CacheUnavailable`.
///
/// [`next_version`]: crate::queue::next_version
#[async_trait]
pub trait FastCache: Send + Sync {
    /// Current record for `key`, if any
    async fn get(&self, key: &CacheKey) -> Result<Option<Fields>>;

    /// Insert or overwrite the record for `key`, returning the write's version
    async fn upsert(&self, key: &CacheKey, fields: Fields) -> Result<u64>;

    /// Seed `key` with a record loaded from the durable store.
    ///
    /// Only takes effect when the key holds nothing, not even a tombstone.
    /// Returns the live record afterwards, which may be one written
    /// concurrently.
    async fn fill(&self, key: &CacheKey, fields: Fields) -> Result<Option<Fields>>;

    /// Apply `changes` to the existing record and return the merged result
    /// with the write's version.
    ///
    /// Returns `Ok(None)` when no live record exists; nothing is written then.
    async fn update(
        &self,
        key: &CacheKey,
        changes: &Fields,
        mode: UpdateMode,
    ) -> Result<Option<(Fields, u64)>>;

    /// Replace a live record with a tombstone, returning the write's version
    async fn delete(&self, key: &CacheKey) -> Result<Option<u64>>;
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of records, tombstones included, before the oldest
    /// are evicted
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
        }
    }
}

impl CacheConfig {
    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let max_entries = std::env::var("CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100_000);

        Self { max_entries }
    }
}
