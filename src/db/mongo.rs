//! MongoDB client and durable store
//!
//! Versioned writes use a filter that only matches documents older than the
//! incoming job. With `upsert` enabled, a stale write turns into an insert
//! attempt on an existing `_id`, which the server rejects with a duplicate
//! key error; that rejection is the stale signal.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection};
use tracing::{debug, info};

use super::schemas::{Metadata, METADATA_FIELD};
use super::{DurableStore, StoreWrite};
use crate::entity::{Fields, ID_FIELD};
use crate::types::{FeedError, Result};

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and ping, failing fast on an unreachable server
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| FeedError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| FeedError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Durable store on MongoDB, one collection per entity kind
#[derive(Clone)]
pub struct MongoStore {
    client: MongoClient,
}

impl MongoStore {
    pub fn new(client: MongoClient) -> Self {
        Self { client }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client
            .inner()
            .database(self.client.db_name())
            .collection::<Document>(name)
    }
}

/// Matches `id` only when the stored version is older than `version`
fn newer_than_stored(id: &str, version: u64) -> Document {
    let version_path = format!("{}.version", METADATA_FIELD);
    doc! {
        ID_FIELD: id,
        "$or": [
            { version_path.as_str(): { "$lt": version as i64 } },
            { version_path.as_str(): { "$exists": false } },
        ],
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY
    )
}

/// Entity fields as a BSON document, without `_id`
fn field_document(fields: &Fields) -> Result<Document> {
    let mut document = bson::to_document(fields)?;
    document.remove(ID_FIELD);
    Ok(document)
}

/// Map a write outcome to [`StoreWrite`]
fn outcome(result: mongodb::error::Result<mongodb::results::UpdateResult>) -> Result<StoreWrite> {
    match result {
        Ok(r) if r.matched_count > 0 || r.upserted_id.is_some() => Ok(StoreWrite::Applied),
        Ok(_) => Ok(StoreWrite::Stale),
        Err(e) if is_duplicate_key(&e) => Ok(StoreWrite::Stale),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DurableStore for MongoStore {
    async fn create(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        version: u64,
    ) -> Result<StoreWrite> {
        let mut replacement = field_document(fields)?;
        replacement.insert(ID_FIELD, id);
        replacement.insert(METADATA_FIELD, bson::to_bson(&Metadata::live(version))?);

        let result = self
            .collection(collection)
            .replace_one(newer_than_stored(id, version), replacement)
            .upsert(true)
            .await;
        let write = outcome(result)?;
        debug!(collection = collection, id = id, version = version, ?write, "Stored create");
        Ok(write)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        version: u64,
    ) -> Result<StoreWrite> {
        let meta = Metadata::live(version);
        let mut set = field_document(fields)?;
        set.insert(format!("{}.version", METADATA_FIELD), meta.version);
        set.insert(
            format!("{}.updated_at", METADATA_FIELD),
            meta.updated_at.map(Bson::DateTime).unwrap_or(Bson::Null),
        );
        let update = doc! {
            "$set": set,
            "$setOnInsert": { format!("{}.is_deleted", METADATA_FIELD): false },
        };

        let result = self
            .collection(collection)
            .update_one(newer_than_stored(id, version), update)
            .upsert(true)
            .await;
        let write = outcome(result)?;
        debug!(collection = collection, id = id, version = version, ?write, "Stored update");
        Ok(write)
    }

    async fn delete(&self, collection: &str, id: &str, version: u64) -> Result<StoreWrite> {
        let update = doc! {
            "$set": { METADATA_FIELD: bson::to_bson(&Metadata::tombstone(version))? },
        };

        let result = self
            .collection(collection)
            .update_one(newer_than_stored(id, version), update)
            .upsert(true)
            .await;
        let write = outcome(result)?;
        debug!(collection = collection, id = id, version = version, ?write, "Stored tombstone");
        Ok(write)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>> {
        let filter = doc! {
            ID_FIELD: id,
            format!("{}.is_deleted", METADATA_FIELD): { "$ne": true },
        };
        let Some(mut document) = self.collection(collection).find_one(filter).await? else {
            return Ok(None);
        };
        document.remove(METADATA_FIELD);

        match Bson::Document(document).into_relaxed_extjson() {
            serde_json::Value::Object(fields) => Ok(Some(fields)),
            other => Err(FeedError::Database(format!(
                "Unexpected document shape: {}",
                other
            ))),
        }
    }

    fn backend(&self) -> &'static str {
        "mongodb"
    }
}
