//! End-to-end write path: coordinator, broadcast, queue and reconciliation
//! through the public API, with recording doubles at the edges.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use feedline::broadcast::{BroadcastEvent, Broadcaster, SocketHub};
use feedline::cache::{CacheKey, FastCache, MemoryCache};
use feedline::db::{DurableStore, MemoryStore, StoreWrite};
use feedline::entity::{EntityKind, Fields, Notification, Post, UpdateMode};
use feedline::queue::{RetryPolicy, WriteJob, WriteOp, WriteQueue};
use feedline::worker::{DeadLetters, PoolConfig, Reconciler, WorkerPool};
use feedline::{CoordinatorConfig, FeedError, MutationCoordinator, Result, Services};

#[derive(Default)]
struct RecordingBroadcaster {
    events: Mutex<Vec<BroadcastEvent>>,
}

impl RecordingBroadcaster {
    fn events(&self) -> Vec<BroadcastEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&self, event: BroadcastEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RecordingQueue {
    jobs: Mutex<Vec<WriteJob>>,
    fail: AtomicBool,
}

impl RecordingQueue {
    fn jobs(&self) -> Vec<WriteJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl WriteQueue for RecordingQueue {
    async fn enqueue(&self, job: WriteJob) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FeedError::QueueUnavailable("broker down".into()));
        }
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "recording"
    }
}

/// Cache that refuses every call
struct DownCache;

#[async_trait]
impl FastCache for DownCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<Fields>> {
        Err(FeedError::CacheUnavailable("connection refused".into()))
    }
    async fn upsert(&self, _: &CacheKey, _: Fields) -> Result<u64> {
        Err(FeedError::CacheUnavailable("connection refused".into()))
    }
    async fn fill(&self, _: &CacheKey, _: Fields) -> Result<Option<Fields>> {
        Err(FeedError::CacheUnavailable("connection refused".into()))
    }
    async fn update(
        &self,
        _: &CacheKey,
        _: &Fields,
        _: UpdateMode,
    ) -> Result<Option<(Fields, u64)>> {
        Err(FeedError::CacheUnavailable("connection refused".into()))
    }
    async fn delete(&self, _: &CacheKey) -> Result<Option<u64>> {
        Err(FeedError::CacheUnavailable("connection refused".into()))
    }
}

struct Fixture {
    cache: Arc<MemoryCache>,
    broadcaster: Arc<RecordingBroadcaster>,
    queue: Arc<RecordingQueue>,
    services: Services,
}

impl Fixture {
    fn new() -> Self {
        let cache = Arc::new(MemoryCache::with_defaults());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let queue = Arc::new(RecordingQueue::default());
        let services = Services {
            cache: cache.clone(),
            broadcaster: broadcaster.clone(),
            queue: queue.clone(),
            store: None,
        };
        Self {
            cache,
            broadcaster,
            queue,
            services,
        }
    }

    fn posts(&self) -> MutationCoordinator<Post> {
        MutationCoordinator::new(self.services.clone(), CoordinatorConfig::default())
    }

    fn notifications(&self) -> MutationCoordinator<Notification> {
        MutationCoordinator::new(self.services.clone(), CoordinatorConfig::default())
    }

    async fn seed(&self, kind: EntityKind, doc: Value) {
        let fields = obj(doc);
        let id = fields["_id"].as_str().unwrap().to_string();
        self.cache.upsert(&CacheKey::new(kind, id), fields).await.unwrap();
    }

    async fn cached(&self, kind: EntityKind, id: &str) -> Option<Fields> {
        self.cache.get(&CacheKey::new(kind, id)).await.unwrap()
    }
}

fn obj(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn update_of_uncached_entity_is_not_found_without_side_effects() {
    let fx = Fixture::new();

    let err = assert_err!(
        fx.posts()
            .apply("p1", &obj(json!({"text": "hi"})), UpdateMode::Merge)
            .await
    );

    assert!(matches!(err, FeedError::NotFound(_)));
    assert!(fx.broadcaster.events().is_empty());
    assert!(fx.queue.jobs().is_empty());
}

#[tokio::test]
async fn update_writes_cache_then_broadcasts_then_queues_same_snapshot() {
    let fx = Fixture::new();
    fx.seed(EntityKind::Post, json!({"_id": "p1", "text": "old"})).await;

    let merged = assert_ok!(
        fx.posts()
            .apply("p1", &obj(json!({"text": "new"})), UpdateMode::Merge)
            .await
    );
    let expected = obj(json!({"_id": "p1", "text": "new"}));
    assert_eq!(merged, expected);
    assert_eq!(fx.cached(EntityKind::Post, "p1").await.unwrap(), expected);

    let events = fx.broadcaster.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "update post");
    assert_eq!(events[0].topic.as_deref(), Some("posts"));
    assert_eq!(events[0].data, Value::Object(expected.clone()));

    let jobs = fx.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name(), "updatePostInDB");
    assert_eq!(jobs[0].key(), "p1");
    assert_eq!(jobs[0].op.value(), Some(&expected));
}

#[tokio::test]
async fn partial_update_leaves_other_fields_untouched() {
    let fx = Fixture::new();
    fx.seed(
        EntityKind::Post,
        json!({"_id": "p1", "text": "old", "privacy": "Public", "feelings": "happy"}),
    )
    .await;

    let merged = fx
        .posts()
        .apply("p1", &obj(json!({"privacy": "Private", "_id": "other"})), UpdateMode::Merge)
        .await
        .unwrap();

    assert_eq!(
        merged,
        obj(json!({"_id": "p1", "text": "old", "privacy": "Private", "feelings": "happy"}))
    );
}

#[tokio::test]
async fn mark_read_broadcasts_bare_id_and_queues_lightweight_job() {
    let fx = Fixture::new();
    fx.seed(EntityKind::Notification, json!({"_id": "n9", "read": false, "message": "hi"}))
        .await;

    assert_ok!(fx.notifications().mark_read("n9").await);

    let events = fx.broadcaster.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "update notification");
    assert_eq!(events[0].data, json!("n9"));
    assert_eq!(events[0].topic, None);

    let jobs = fx.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name(), "updateNotification");
    assert_eq!(jobs[0].op, WriteOp::MarkNotificationRead { key: "n9".into() });

    let cached = fx.cached(EntityKind::Notification, "n9").await.unwrap();
    assert_eq!(cached["read"], json!(true));
}

#[tokio::test]
async fn mark_read_of_uncached_notification_still_broadcasts_and_queues() {
    let fx = Fixture::new();

    assert_ok!(fx.notifications().mark_read("n1").await);

    assert!(fx.cached(EntityKind::Notification, "n1").await.is_none());
    assert_eq!(fx.broadcaster.events().len(), 1);
    assert_eq!(fx.queue.jobs().len(), 1);
}

#[tokio::test]
async fn queue_failure_after_cache_and_broadcast_is_not_rolled_back() {
    let fx = Fixture::new();
    fx.seed(EntityKind::Post, json!({"_id": "p1", "text": "old"})).await;
    fx.queue.fail.store(true, Ordering::SeqCst);

    let err = assert_err!(
        fx.posts()
            .apply("p1", &obj(json!({"text": "new"})), UpdateMode::Merge)
            .await
    );

    assert!(matches!(err, FeedError::QueueUnavailable(_)));
    assert!(err.is_degraded_success());
    assert_eq!(
        fx.cached(EntityKind::Post, "p1").await.unwrap()["text"],
        json!("new")
    );
    assert_eq!(fx.broadcaster.events().len(), 1);
    assert!(fx.queue.jobs().is_empty());
}

#[tokio::test]
async fn cache_failure_aborts_before_broadcast_and_enqueue() {
    let fx = Fixture::new();
    let services = Services {
        cache: Arc::new(DownCache),
        broadcaster: fx.broadcaster.clone(),
        queue: fx.queue.clone(),
        store: None,
    };
    let posts = MutationCoordinator::<Post>::new(services, CoordinatorConfig::default());

    let update = posts
        .apply("p1", &obj(json!({"text": "new"})), UpdateMode::Merge)
        .await;
    assert!(matches!(update, Err(FeedError::CacheUnavailable(_))));
    let create = posts.create("p2", &obj(json!({"text": "x"}))).await;
    assert!(matches!(create, Err(FeedError::CacheUnavailable(_))));

    assert!(fx.broadcaster.events().is_empty());
    assert!(fx.queue.jobs().is_empty());
}

const ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

/// Reconcile `jobs` in every order and return what each store ended up with
async fn reconcile_in_every_order(kind: EntityKind, id: &str, jobs: &[WriteJob]) -> Vec<Option<Fields>> {
    let mut outcomes = Vec::new();
    for order in ORDERS {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        for i in order {
            reconciler.apply(&jobs[i]).await.unwrap();
        }
        outcomes.push(store.get(kind.collection(), id).await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn mixed_replace_and_merge_jobs_converge_in_any_order() {
    let fx = Fixture::new();
    let posts = fx.posts();
    posts
        .create("p1", &obj(json!({"text": "a", "privacy": "Public"})))
        .await
        .unwrap();
    posts
        .apply("p1", &obj(json!({"text": "b"})), UpdateMode::Replace)
        .await
        .unwrap();
    let last = posts
        .apply("p1", &obj(json!({"text": "c"})), UpdateMode::Merge)
        .await
        .unwrap();

    let jobs = fx.queue.jobs();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.windows(2).all(|w| w[1].version > w[0].version));
    assert_eq!(last, obj(json!({"_id": "p1", "text": "c"})));

    for outcome in reconcile_in_every_order(EntityKind::Post, "p1", &jobs).await {
        assert_eq!(outcome.as_ref(), Some(&last));
    }
}

#[tokio::test]
async fn delete_wins_over_create_and_update_in_any_order() {
    let fx = Fixture::new();
    let posts = fx.posts();
    posts.create("p1", &obj(json!({"text": "a"}))).await.unwrap();
    posts
        .apply("p1", &obj(json!({"feelings": "happy"})), UpdateMode::Merge)
        .await
        .unwrap();
    posts.delete("p1").await.unwrap();

    let jobs = fx.queue.jobs();
    assert_eq!(jobs[2].name(), "deletePostFromDB");

    for outcome in reconcile_in_every_order(EntityKind::Post, "p1", &jobs).await {
        assert_eq!(outcome, None);
    }
}

/// Cache whose update replies are held back for one value of `text`
struct SlowReplyCache {
    inner: MemoryCache,
    slow_text: &'static str,
    delay: Duration,
}

#[async_trait]
impl FastCache for SlowReplyCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Fields>> {
        self.inner.get(key).await
    }
    async fn upsert(&self, key: &CacheKey, fields: Fields) -> Result<u64> {
        self.inner.upsert(key, fields).await
    }
    async fn fill(&self, key: &CacheKey, fields: Fields) -> Result<Option<Fields>> {
        self.inner.fill(key, fields).await
    }
    async fn update(
        &self,
        key: &CacheKey,
        changes: &Fields,
        mode: UpdateMode,
    ) -> Result<Option<(Fields, u64)>> {
        let written = self.inner.update(key, changes, mode).await?;
        if changes.get("text") == Some(&json!(self.slow_text)) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(written)
    }
    async fn delete(&self, key: &CacheKey) -> Result<Option<u64>> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn concurrent_edits_settle_on_the_same_winner_in_cache_and_store() {
    let cache = Arc::new(SlowReplyCache {
        inner: MemoryCache::with_defaults(),
        slow_text: "A",
        delay: Duration::from_millis(50),
    });
    let queue = Arc::new(RecordingQueue::default());
    let posts = MutationCoordinator::<Post>::new(
        Services {
            cache: cache.clone(),
            broadcaster: Arc::new(RecordingBroadcaster::default()),
            queue: queue.clone(),
            store: None,
        },
        CoordinatorConfig::default(),
    );
    posts.create("p1", &obj(json!({"text": "seed"}))).await.unwrap();

    let first = {
        let posts = posts.clone();
        tokio::spawn(async move {
            posts
                .apply("p1", &obj(json!({"text": "A"})), UpdateMode::Merge)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = posts
        .apply("p1", &obj(json!({"text": "B"})), UpdateMode::Merge)
        .await;
    assert_ok!(second);
    assert_ok!(first.await.unwrap());

    let cached = cache.get(&CacheKey::new(EntityKind::Post, "p1")).await.unwrap();
    assert_eq!(cached.as_ref().unwrap()["text"], json!("B"));

    // Jobs reach the store in the order they were enqueued: B before A
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone());
    for job in queue.jobs() {
        reconciler.apply(&job).await.unwrap();
    }
    assert_eq!(store.get("posts", "p1").await.unwrap(), cached);
}

#[tokio::test]
async fn replayed_job_leaves_store_unchanged() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone());
    let job = WriteJob::new(WriteOp::Create {
        kind: EntityKind::Post,
        key: "p1".into(),
        value: obj(json!({"_id": "p1", "text": "hi"})),
    });

    assert_eq!(assert_ok!(reconciler.apply(&job).await), StoreWrite::Applied);
    let once = store.record("posts", "p1").unwrap();
    assert_eq!(assert_ok!(reconciler.apply(&job).await), StoreWrite::Stale);
    assert_eq!(store.record("posts", "p1").unwrap(), once);
}

#[tokio::test]
async fn delete_tombstone_wins_over_earlier_update_delivered_late() {
    let fx = Fixture::new();
    fx.seed(EntityKind::Post, json!({"_id": "p1", "text": "old"})).await;
    let posts = fx.posts();
    posts
        .apply("p1", &obj(json!({"text": "new"})), UpdateMode::Merge)
        .await
        .unwrap();
    posts.delete("p1").await.unwrap();

    let jobs = fx.queue.jobs();
    assert_eq!(jobs[1].name(), "deletePostFromDB");

    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone());
    reconciler.apply(&jobs[1]).await.unwrap();
    assert_eq!(reconciler.apply(&jobs[0]).await.unwrap(), StoreWrite::Stale);
    assert!(store.get("posts", "p1").await.unwrap().is_none());
}

#[tokio::test]
async fn pool_persists_what_the_coordinator_cached() {
    let cache = Arc::new(MemoryCache::with_defaults());
    let hub = Arc::new(SocketHub::default());
    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(WorkerPool::start(
        PoolConfig::default(),
        Reconciler::new(store.clone()),
        Arc::new(DeadLetters::new()),
    ));
    let services = Services {
        cache: cache.clone(),
        broadcaster: hub.clone(),
        queue: pool.clone(),
        store: Some(store.clone()),
    };
    let posts = MutationCoordinator::<Post>::new(services, CoordinatorConfig::default());

    let mut feed = hub.subscribe();
    feed.join("posts");

    posts
        .create("p1", &obj(json!({"text": "first"})))
        .await
        .unwrap();
    let merged = posts
        .apply("p1", &obj(json!({"text": "second"})), UpdateMode::Merge)
        .await
        .unwrap();
    pool.flush().await;

    assert_eq!(store.get("posts", "p1").await.unwrap().unwrap(), merged);
    assert_eq!(feed.next().await.unwrap().event, "add post");
    let update = feed.next().await.unwrap();
    assert_eq!(update.event, "update post");
    assert_eq!(update.data, Value::Object(merged));
}

struct AlwaysFailingStore;

#[async_trait]
impl DurableStore for AlwaysFailingStore {
    async fn create(&self, _: &str, _: &str, _: &Fields, _: u64) -> Result<StoreWrite> {
        Err(FeedError::Database("write concern timeout".into()))
    }
    async fn update(&self, _: &str, _: &str, _: &Fields, _: u64) -> Result<StoreWrite> {
        Err(FeedError::Database("write concern timeout".into()))
    }
    async fn delete(&self, _: &str, _: &str, _: u64) -> Result<StoreWrite> {
        Err(FeedError::Database("write concern timeout".into()))
    }
    async fn get(&self, _: &str, _: &str) -> Result<Option<Fields>> {
        Ok(None)
    }
    fn backend(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn exhausted_job_is_dead_lettered_not_dropped() {
    let dead_letters = Arc::new(DeadLetters::new());
    let pool = WorkerPool::start(
        PoolConfig {
            worker_count: 1,
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            ..Default::default()
        },
        Reconciler::new(Arc::new(AlwaysFailingStore)),
        Arc::clone(&dead_letters),
    );

    let job = WriteJob::new(WriteOp::MarkNotificationRead { key: "n9".into() });
    let job_id = job.job_id;
    pool.enqueue(job).await.unwrap();
    pool.flush().await;

    let letters = dead_letters.list();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job.job_id, job_id);
    assert_eq!(letters[0].attempts, 3);
    assert!(letters[0].error.contains("write concern timeout"));
}
