//! In-memory fast cache
//!
//! DashMap-backed record store. Per-key writes run under the shard write
//! lock, which gives the atomic read-modify-write the coordinator relies on.
//! The version handed back for each write is taken under the same lock.
//! Deletes leave a tombstone so a stale durable record cannot be filled back
//! in behind them.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use super::{CacheConfig, CacheKey, FastCache};
use crate::entity::{Fields, UpdateMode};
use crate::queue::next_version;
use crate::types::Result;

/// A cached record with bookkeeping
#[derive(Debug, Clone)]
struct CacheRecord {
    fields: Fields,
    /// Version of the last write through this cache, 0 for a filled record
    version: u64,
    deleted: bool,
    updated_at: Instant,
}

impl CacheRecord {
    fn live(fields: Fields, version: u64) -> Self {
        Self {
            fields,
            version,
            deleted: false,
            updated_at: Instant::now(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// In-memory entity cache
pub struct MemoryCache {
    /// storage_key -> record
    entries: DashMap<String, CacheRecord>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        info!(max_entries = config.max_entries, "MemoryCache initialized");
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Version of the last write to `key`, tombstones included
    pub fn version(&self, key: &CacheKey) -> Option<u64> {
        self.entries.get(&key.to_storage_key()).map(|r| r.version)
    }

    /// Evict the least recently written records until one more fits.
    ///
    /// Frees a tenth of the capacity at a time so the age scan runs once per
    /// batch rather than on every insert.
    fn evict_if_full(&self) {
        if self.entries.len() < self.config.max_entries {
            return;
        }

        let batch = (self.config.max_entries / 10).max(1);
        let to_free = (self.entries.len() + 1 - self.config.max_entries).max(batch);
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.updated_at))
            .collect();
        by_age.sort_by_key(|(_, updated_at)| *updated_at);

        let mut freed = 0;
        for (key, _) in by_age.into_iter().take(to_free) {
            if self.entries.remove(&key).is_some() {
                freed += 1;
            }
        }

        self.evictions.fetch_add(freed, Ordering::Relaxed);
        debug!(freed = freed, "Evicted cache records to make space");
    }

    fn make_room(&self, storage_key: &str) {
        if !self.entries.contains_key(storage_key) {
            self.evict_if_full();
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Fields>> {
        let storage_key = key.to_storage_key();
        match self.entries.get(&storage_key).filter(|r| !r.deleted) {
            Some(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %storage_key, "Cache hit");
                Ok(Some(record.fields.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %storage_key, "Cache miss");
                Ok(None)
            }
        }
    }

    async fn upsert(&self, key: &CacheKey, fields: Fields) -> Result<u64> {
        let storage_key = key.to_storage_key();
        self.make_room(&storage_key);

        let mut record = self
            .entries
            .entry(storage_key)
            .or_insert_with(|| CacheRecord::live(Fields::new(), 0));
        let version = next_version();
        *record = CacheRecord::live(fields, version);
        Ok(version)
    }

    async fn fill(&self, key: &CacheKey, fields: Fields) -> Result<Option<Fields>> {
        let storage_key = key.to_storage_key();
        self.make_room(&storage_key);

        let current = match self.entries.entry(storage_key) {
            Entry::Occupied(entry) => {
                let record = entry.get();
                (!record.deleted).then(|| record.fields.clone())
            }
            Entry::Vacant(entry) => {
                debug!(key = %key, "Cache filled from durable store");
                entry.insert(CacheRecord::live(fields.clone(), 0));
                Some(fields)
            }
        };
        Ok(current)
    }

    async fn update(
        &self,
        key: &CacheKey,
        changes: &Fields,
        mode: UpdateMode,
    ) -> Result<Option<(Fields, u64)>> {
        let storage_key = key.to_storage_key();
        let Some(mut record) = self
            .entries
            .get_mut(&storage_key)
            .filter(|r| !r.deleted)
        else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        mode.apply(&mut record.fields, changes, &key.id);
        record.version = next_version();
        record.updated_at = Instant::now();
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %storage_key, ?mode, version = record.version, "Cache record updated");
        Ok(Some((record.fields.clone(), record.version)))
    }

    async fn delete(&self, key: &CacheKey) -> Result<Option<u64>> {
        let Some(mut record) = self
            .entries
            .get_mut(&key.to_storage_key())
            .filter(|r| !r.deleted)
        else {
            return Ok(None);
        };

        record.fields = Fields::new();
        record.deleted = true;
        record.version = next_version();
        record.updated_at = Instant::now();
        Ok(Some(record.version))
    }
}

/// ETag for a serialized entity (SHA256, first 16 bytes)
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let hash = hasher.finalize();
    format!("\"{}\"", hex::encode(&hash[..16]))
}
