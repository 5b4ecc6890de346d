//! Mutation coordinator
//!
//! Every accepted write runs the same sequence:
//! 1. write the fast cache (the read-your-own-write view)
//! 2. broadcast the new state to connected clients
//! 3. submit a durable write job
//! 4. respond
//!
//! The version stamped by the cache write travels with the job, so the
//! durable store settles on the same winner as the cache. A cache miss is
//! filled from the durable store, when one is attached, before an edit is
//! refused as not found.
//!
//! Only the cache write can abort a mutation. A failed enqueue happens after
//! the change is already visible, so it is reported as `QueueUnavailable`
//! and left in place. The coordinator never retries.

pub mod media;

pub use media::{HttpUploader, MediaUploader, UploadedMedia};

use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::broadcast::{BroadcastEvent, Broadcaster};
use crate::cache::{CacheKey, FastCache};
use crate::db::DurableStore;
use crate::entity::{EntityKind, EntityType, Fields, Notification, UpdateMode};
use crate::queue::{next_version, WriteJob, WriteOp, WriteQueue};
use crate::types::{FeedError, Result};

/// Field carrying an inline image on media updates
pub const IMAGE_FIELD: &str = "image";
pub const IMG_ID_FIELD: &str = "imgId";
pub const IMG_VERSION_FIELD: &str = "imgVersion";

/// Shared handles every coordinator works through
#[derive(Clone)]
pub struct Services {
    pub cache: Arc<dyn FastCache>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub queue: Arc<dyn WriteQueue>,
    /// Read-through source for cache misses
    pub store: Option<Arc<dyn DurableStore>>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on the cache write and on the enqueue submission, each
    pub step_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
        }
    }
}

/// Write-path coordinator for one entity type
pub struct MutationCoordinator<E: EntityType> {
    services: Services,
    config: CoordinatorConfig,
    _entity: PhantomData<E>,
}

impl<E: EntityType> Clone for MutationCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            services: self.services.clone(),
            config: self.config.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: EntityType> MutationCoordinator<E> {
    pub fn new(services: Services, config: CoordinatorConfig) -> Self {
        Self {
            services,
            config,
            _entity: PhantomData,
        }
    }

    fn key(id: &str) -> CacheKey {
        CacheKey::new(E::KIND, id)
    }

    /// Current view of the entity, filled from the durable store on a miss
    pub async fn get(&self, id: &str) -> Result<Option<Fields>> {
        match self.cache_step(self.services.cache.get(&Self::key(id))).await? {
            Some(fields) => Ok(Some(fields)),
            None => self.read_through(id).await,
        }
    }

    /// Apply a full or partial update to an existing entity
    pub async fn apply(&self, id: &str, changes: &Fields, mode: UpdateMode) -> Result<Fields> {
        let (merged, version) = self
            .update_cached(id, changes, mode)
            .await?
            .ok_or_else(|| FeedError::NotFound(format!("{} {}", E::KIND, id)))?;

        self.publish(E::KIND.update_event(), Value::Object(merged.clone()));
        self.enqueue(
            WriteOp::Update {
                kind: E::KIND,
                key: id.to_string(),
                value: merged.clone(),
                mode,
            },
            version,
        )
        .await?;

        Ok(merged)
    }

    /// Insert the entity, replacing any cached record with the same id
    pub async fn create(&self, id: &str, fields: &Fields) -> Result<Fields> {
        let mut document = Fields::new();
        UpdateMode::Replace.apply(&mut document, fields, id);

        let version = self
            .cache_step(self.services.cache.upsert(&Self::key(id), document.clone()))
            .await?;

        self.publish(E::KIND.add_event(), Value::Object(document.clone()));
        self.enqueue(
            WriteOp::Create {
                kind: E::KIND,
                key: id.to_string(),
                value: document.clone(),
            },
            version,
        )
        .await?;

        Ok(document)
    }

    /// Remove an existing entity
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = Self::key(id);
        let mut deleted = self.cache_step(self.services.cache.delete(&key)).await?;
        if deleted.is_none() && self.read_through(id).await?.is_some() {
            deleted = self.cache_step(self.services.cache.delete(&key)).await?;
        }
        let version =
            deleted.ok_or_else(|| FeedError::NotFound(format!("{} {}", E::KIND, id)))?;

        self.publish(E::KIND.delete_event(), Value::String(id.to_string()));
        self.enqueue(
            WriteOp::Delete {
                kind: E::KIND,
                key: id.to_string(),
            },
            version,
        )
        .await
    }

    /// Partial update that may carry an inline image.
    ///
    /// Without an existing `imgId`/`imgVersion` pair the `image` data URI is
    /// uploaded first and the returned reference replaces it. Upload failures
    /// abort before anything is written.
    pub async fn apply_with_media(
        &self,
        id: &str,
        changes: &Fields,
        uploader: &dyn MediaUploader,
    ) -> Result<Fields> {
        let mut changes = changes.clone();

        if !has_media_reference(&changes) {
            if self.get(id).await?.is_none() {
                return Err(FeedError::NotFound(format!("{} {}", E::KIND, id)));
            }
            let image = changes
                .get(IMAGE_FIELD)
                .and_then(Value::as_str)
                .ok_or_else(|| FeedError::BadRequest("image is required".into()))?;

            let uploaded = uploader.upload(image).await?;
            debug!(id = id, public_id = %uploaded.public_id, "Image uploaded");

            changes.insert(IMG_ID_FIELD.to_string(), Value::String(uploaded.public_id));
            changes.insert(
                IMG_VERSION_FIELD.to_string(),
                Value::String(uploaded.version.to_string()),
            );
        }
        changes.remove(IMAGE_FIELD);

        self.apply(id, &changes, UpdateMode::Merge).await
    }

    /// Cache update, retried once after a read-through fill on a miss
    async fn update_cached(
        &self,
        id: &str,
        changes: &Fields,
        mode: UpdateMode,
    ) -> Result<Option<(Fields, u64)>> {
        let key = Self::key(id);
        let hit = self
            .cache_step(self.services.cache.update(&key, changes, mode))
            .await?;
        if hit.is_some() || self.read_through(id).await?.is_none() {
            return Ok(hit);
        }
        self.cache_step(self.services.cache.update(&key, changes, mode))
            .await
    }

    /// Load a live entity from the durable store into the cache
    async fn read_through(&self, id: &str) -> Result<Option<Fields>> {
        let Some(store) = &self.services.store else {
            return Ok(None);
        };
        let stored = tokio::time::timeout(
            self.config.step_timeout,
            store.get(E::KIND.collection(), id),
        )
        .await
        .map_err(|_| FeedError::Database("Durable store lookup timed out".into()))??;

        match stored {
            Some(fields) => {
                debug!(kind = %E::KIND, id = id, "Cache miss served from durable store");
                self.cache_step(self.services.cache.fill(&Self::key(id), fields))
                    .await
            }
            None => Ok(None),
        }
    }

    async fn cache_step<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.step_timeout, step)
            .await
            .map_err(|_| FeedError::CacheUnavailable("Cache write timed out".into()))?
    }

    fn publish(&self, event: &str, data: Value) {
        self.services
            .broadcaster
            .publish(BroadcastEvent::new(event, data, E::KIND.topic()));
    }

    async fn enqueue(&self, op: WriteOp, version: u64) -> Result<()> {
        enqueue_job(&self.services, &self.config, WriteJob::with_version(op, version)).await
    }
}

impl MutationCoordinator<Notification> {
    /// Mark a notification read.
    ///
    /// The cached or durable record, if any, gets `read: true`; a missing
    /// record is fine. The broadcast carries only the id.
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let mut read = Fields::new();
        read.insert("read".to_string(), Value::Bool(true));

        let version = match self.update_cached(id, &read, UpdateMode::Merge).await? {
            Some((_, version)) => version,
            None => next_version(),
        };

        self.services.broadcaster.publish(BroadcastEvent::new(
            EntityKind::Notification.update_event(),
            Value::String(id.to_string()),
            None,
        ));
        self.enqueue(WriteOp::MarkNotificationRead { key: id.to_string() }, version)
            .await
    }
}

fn has_media_reference(changes: &Fields) -> bool {
    let present = |field: &str| match changes.get(field) {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(_)) => true,
        _ => false,
    };
    present(IMG_ID_FIELD) && present(IMG_VERSION_FIELD)
}

async fn enqueue_job(services: &Services, config: &CoordinatorConfig, job: WriteJob) -> Result<()> {
    let (name, key, version) = (job.name(), job.key().to_string(), job.version);

    let result = tokio::time::timeout(config.step_timeout, services.queue.enqueue(job))
        .await
        .unwrap_or_else(|_| Err(FeedError::QueueUnavailable("Enqueue timed out".into())));

    match result {
        Ok(()) => {
            debug!(job = name, key = %key, version = version, "Mutation queued");
            Ok(())
        }
        Err(e) => {
            error!(
                job = name,
                key = %key,
                error = %e,
                "Mutation applied to cache and broadcast but not queued for persistence"
            );
            match e {
                FeedError::QueueUnavailable(_) => Err(e),
                other => Err(FeedError::QueueUnavailable(other.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MemoryCache};
    use crate::db::MemoryStore;
    use crate::entity::Post;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroadcaster(Mutex<Vec<BroadcastEvent>>);

    impl Broadcaster for RecordingBroadcaster {
        fn publish(&self, event: BroadcastEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct RecordingQueue(Mutex<Vec<WriteJob>>);

    #[async_trait]
    impl WriteQueue for RecordingQueue {
        async fn enqueue(&self, job: WriteJob) -> Result<()> {
            self.0.lock().unwrap().push(job);
            Ok(())
        }
        fn backend(&self) -> &'static str {
            "recording"
        }
    }

    struct HangingQueue;

    #[async_trait]
    impl WriteQueue for HangingQueue {
        async fn enqueue(&self, _job: WriteJob) -> Result<()> {
            std::future::pending().await
        }
        fn backend(&self) -> &'static str {
            "hanging"
        }
    }

    struct FixedUploader {
        calls: AtomicUsize,
        result: Option<UploadedMedia>,
    }

    #[async_trait]
    impl MediaUploader for FixedUploader {
        async fn upload(&self, _data_uri: &str) -> Result<UploadedMedia> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .ok_or_else(|| FeedError::Upload("rejected".into()))
        }
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    struct Harness {
        cache: Arc<MemoryCache>,
        broadcaster: Arc<RecordingBroadcaster>,
        queue: Arc<RecordingQueue>,
        posts: MutationCoordinator<Post>,
    }

    async fn harness() -> Harness {
        let cache = Arc::new(MemoryCache::with_defaults());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let queue = Arc::new(RecordingQueue::default());
        let services = Services {
            cache: cache.clone(),
            broadcaster: broadcaster.clone(),
            queue: queue.clone(),
            store: None,
        };
        cache
            .upsert(
                &CacheKey::new(EntityKind::Post, "p1"),
                fields(json!({"_id": "p1", "text": "old", "privacy": "Public"})),
            )
            .await
            .unwrap();
        Harness {
            cache,
            broadcaster,
            queue,
            posts: MutationCoordinator::new(services, CoordinatorConfig::default()),
        }
    }

    #[tokio::test]
    async fn test_replace_keeps_only_submitted_fields() {
        let h = harness().await;
        let result = h
            .posts
            .apply("p1", &fields(json!({"text": "new"})), UpdateMode::Replace)
            .await
            .unwrap();
        assert_eq!(result, fields(json!({"_id": "p1", "text": "new"})));

        let job = &h.queue.0.lock().unwrap()[0];
        assert!(matches!(job.op, WriteOp::Update { mode: UpdateMode::Replace, .. }));
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let h = harness().await;
        let created = h
            .posts
            .create("p2", &fields(json!({"_id": "ignored", "text": "hello"})))
            .await
            .unwrap();
        assert_eq!(created["_id"], json!("p2"));

        h.posts.delete("p2").await.unwrap();
        assert!(h.cache.get(&CacheKey::new(EntityKind::Post, "p2")).await.unwrap().is_none());

        let events: Vec<String> = h.broadcaster.0.lock().unwrap().iter().map(|e| e.event.clone()).collect();
        assert_eq!(events, vec!["add post", "delete post"]);
        let jobs: Vec<&'static str> = h.queue.0.lock().unwrap().iter().map(|j| j.name()).collect();
        assert_eq!(jobs, vec!["addPostToDB", "deletePostFromDB"]);

        assert!(matches!(h.posts.delete("p2").await, Err(FeedError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_media_reference_skips_upload() {
        let h = harness().await;
        let uploader = FixedUploader {
            calls: AtomicUsize::new(0),
            result: None,
        };
        let result = h
            .posts
            .apply_with_media(
                "p1",
                &fields(json!({"text": "pic", "imgId": "abc", "imgVersion": "7", "image": "data:x"})),
                &uploader,
            )
            .await
            .unwrap();

        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result["imgId"], json!("abc"));
        assert!(!result.contains_key("image"));
    }

    #[tokio::test]
    async fn test_media_upload_folds_reference() {
        let h = harness().await;
        let uploader = FixedUploader {
            calls: AtomicUsize::new(0),
            result: Some(UploadedMedia {
                public_id: "img-42".into(),
                version: 1700000000,
            }),
        };
        let result = h
            .posts
            .apply_with_media(
                "p1",
                &fields(json!({"text": "pic", "image": "data:image/png;base64,aGVsbG8="})),
                &uploader,
            )
            .await
            .unwrap();

        assert_eq!(result["imgId"], json!("img-42"));
        assert_eq!(result["imgVersion"], json!("1700000000"));
        assert!(!result.contains_key("image"));
        let job = &h.queue.0.lock().unwrap()[0];
        assert_eq!(job.op.value(), Some(&result));
    }

    #[tokio::test]
    async fn test_failed_upload_has_no_side_effects() {
        let h = harness().await;
        let uploader = FixedUploader {
            calls: AtomicUsize::new(0),
            result: None,
        };
        let err = h
            .posts
            .apply_with_media("p1", &fields(json!({"text": "pic", "image": "data:x"})), &uploader)
            .await
            .unwrap_err();

        assert!(matches!(err, FeedError::Upload(_)));
        assert!(h.broadcaster.0.lock().unwrap().is_empty());
        assert!(h.queue.0.lock().unwrap().is_empty());
        let cached = h.cache.get(&CacheKey::new(EntityKind::Post, "p1")).await.unwrap().unwrap();
        assert_eq!(cached["text"], json!("old"));
    }

    #[tokio::test]
    async fn test_enqueue_timeout_is_queue_unavailable() {
        let h = harness().await;
        let services = Services {
            cache: h.cache.clone(),
            broadcaster: h.broadcaster.clone(),
            queue: Arc::new(HangingQueue),
            store: None,
        };
        let posts = MutationCoordinator::<Post>::new(
            services,
            CoordinatorConfig {
                step_timeout: Duration::from_millis(20),
            },
        );

        let err = posts
            .apply("p1", &fields(json!({"text": "new"})), UpdateMode::Merge)
            .await
            .unwrap_err();
        assert!(err.is_degraded_success());
        assert_eq!(h.broadcaster.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_entity_is_read_through() {
        let cache = Arc::new(MemoryCache::new(CacheConfig { max_entries: 2 }));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let posts = MutationCoordinator::<Post>::new(
            Services {
                cache: cache.clone(),
                broadcaster: Arc::new(RecordingBroadcaster::default()),
                queue: queue.clone(),
                store: Some(store.clone()),
            },
            CoordinatorConfig::default(),
        );

        for id in ["p1", "p2", "p3"] {
            posts
                .create(id, &fields(json!({"text": id, "privacy": "Public"})))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // The store has caught up, the cache has dropped p1
        let created = queue.0.lock().unwrap().clone();
        let reconciler = crate::worker::Reconciler::new(store.clone());
        for job in &created {
            reconciler.apply(job).await.unwrap();
        }
        assert!(cache.get(&CacheKey::new(EntityKind::Post, "p1")).await.unwrap().is_none());

        let edited = posts
            .apply("p1", &fields(json!({"text": "edit"})), UpdateMode::Merge)
            .await
            .unwrap();
        assert_eq!(edited, fields(json!({"_id": "p1", "text": "edit", "privacy": "Public"})));

        posts.delete("p2").await.unwrap();
        assert!(posts.get("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_entity_is_not_read_back_from_lagging_store() {
        let cache = Arc::new(MemoryCache::with_defaults());
        let store = Arc::new(MemoryStore::new());
        store
            .create("posts", "p1", &fields(json!({"_id": "p1", "text": "old"})), 1)
            .await
            .unwrap();
        let posts = MutationCoordinator::<Post>::new(
            Services {
                cache,
                broadcaster: Arc::new(RecordingBroadcaster::default()),
                queue: Arc::new(RecordingQueue::default()),
                store: Some(store),
            },
            CoordinatorConfig::default(),
        );

        assert!(posts.get("p1").await.unwrap().is_some());
        posts.delete("p1").await.unwrap();

        // The delete job has not reached the store yet
        let err = posts
            .apply("p1", &fields(json!({"text": "late"})), UpdateMode::Merge)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_without_store_a_miss_is_not_found() {
        let h = harness().await;
        let err = h
            .posts
            .apply("nope", &fields(json!({"text": "x"})), UpdateMode::Merge)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::NotFound(_)));
        assert!(h.queue.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_versions_follow_cache_write_order() {
        let h = harness().await;
        let mut handles = Vec::new();
        for n in 0..16 {
            let posts = h.posts.clone();
            handles.push(tokio::spawn(async move {
                posts
                    .apply("p1", &fields(json!({"text": n})), UpdateMode::Merge)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let cached = h.cache.get(&CacheKey::new(EntityKind::Post, "p1")).await.unwrap();
        let jobs = h.queue.0.lock().unwrap().clone();
        let newest = jobs.iter().max_by_key(|j| j.version).unwrap();
        assert_eq!(newest.op.value(), cached.as_ref());
    }
}
