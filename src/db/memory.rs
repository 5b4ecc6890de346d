//! In-memory durable store for dev mode and tests
//!
//! Same versioning and tombstone rules as the MongoDB store.

use dashmap::DashMap;

use super::schemas::Metadata;
use super::{DurableStore, StoreWrite};
use crate::entity::{Fields, ID_FIELD};
use crate::types::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Stored document with its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub fields: Fields,
    pub metadata: Metadata,
}

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(collection: &str, id: &str) -> String {
        format!("{}:{}", collection, id)
    }

    /// Raw record including tombstones
    pub fn record(&self, collection: &str, id: &str) -> Option<StoredRecord> {
        self.records
            .get(&Self::key(collection, id))
            .map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn with_id(fields: &Fields, id: &str) -> Fields {
    let mut out = fields.clone();
    out.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    out
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn create(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        version: u64,
    ) -> Result<StoreWrite> {
        let mut entry = self
            .records
            .entry(Self::key(collection, id))
            .or_insert_with(|| StoredRecord {
                fields: Fields::new(),
                metadata: Metadata::default(),
            });
        if !entry.metadata.accepts(version) {
            return Ok(StoreWrite::Stale);
        }
        entry.fields = with_id(fields, id);
        entry.metadata = Metadata::live(version);
        Ok(StoreWrite::Applied)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        version: u64,
    ) -> Result<StoreWrite> {
        let mut entry = self
            .records
            .entry(Self::key(collection, id))
            .or_insert_with(|| StoredRecord {
                fields: Fields::new(),
                metadata: Metadata::default(),
            });
        if !entry.metadata.accepts(version) {
            return Ok(StoreWrite::Stale);
        }
        for (field, value) in fields {
            if field != ID_FIELD {
                entry.fields.insert(field.clone(), value.clone());
            }
        }
        entry
            .fields
            .insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        // An update never revives a tombstone
        let is_deleted = entry.metadata.is_deleted;
        let deleted_at = entry.metadata.deleted_at;
        entry.metadata = Metadata {
            is_deleted,
            deleted_at,
            ..Metadata::live(version)
        };
        Ok(StoreWrite::Applied)
    }

    async fn delete(&self, collection: &str, id: &str, version: u64) -> Result<StoreWrite> {
        let mut entry = self
            .records
            .entry(Self::key(collection, id))
            .or_insert_with(|| StoredRecord {
                fields: with_id(&Fields::new(), id),
                metadata: Metadata::default(),
            });
        if !entry.metadata.accepts(version) {
            return Ok(StoreWrite::Stale);
        }
        entry.metadata = Metadata::tombstone(version);
        Ok(StoreWrite::Applied)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>> {
        Ok(self
            .records
            .get(&Self::key(collection, id))
            .filter(|r| !r.metadata.is_deleted && r.metadata.version > 0)
            .map(|r| r.fields.clone()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_replay_is_stale_and_harmless() {
        let store = MemoryStore::new();
        let doc = fields(json!({"_id": "p1", "text": "hi"}));

        assert_eq!(store.create("posts", "p1", &doc, 10).await.unwrap(), StoreWrite::Applied);
        let first = store.record("posts", "p1").unwrap().fields;
        assert_eq!(store.create("posts", "p1", &doc, 10).await.unwrap(), StoreWrite::Stale);
        assert_eq!(store.record("posts", "p1").unwrap().fields, first);
    }

    #[tokio::test]
    async fn test_older_update_loses() {
        let store = MemoryStore::new();
        let newer = fields(json!({"_id": "p1", "text": "new"}));
        let older = fields(json!({"_id": "p1", "text": "old"}));

        store.update("posts", "p1", &newer, 20).await.unwrap();
        assert_eq!(store.update("posts", "p1", &older, 10).await.unwrap(), StoreWrite::Stale);
        assert_eq!(
            store.get("posts", "p1").await.unwrap().unwrap()["text"],
            json!("new")
        );
    }

    #[tokio::test]
    async fn test_tombstone_blocks_older_update() {
        let store = MemoryStore::new();
        let doc = fields(json!({"_id": "p1", "text": "hi"}));

        store.create("posts", "p1", &doc, 10).await.unwrap();
        store.delete("posts", "p1", 30).await.unwrap();
        assert_eq!(store.update("posts", "p1", &doc, 20).await.unwrap(), StoreWrite::Stale);
        assert!(store.get("posts", "p1").await.unwrap().is_none());
        assert!(store.record("posts", "p1").unwrap().metadata.is_deleted);

        // A newer create brings it back
        store.create("posts", "p1", &doc, 40).await.unwrap();
        assert!(store.get("posts", "p1").await.unwrap().is_some());
    }
}
