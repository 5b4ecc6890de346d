//! feedline - social feed backend

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use feedline::{
    broadcast::{Broadcaster, NatsRelay, SocketHub},
    cache::{CacheConfig, MemoryCache},
    config::Args,
    coordinator::{HttpUploader, Services},
    db::{DurableStore, MemoryStore, MongoClient, MongoStore},
    logging,
    nats::NatsClient,
    queue::{jetstream::JetStreamQueueConfig, JetStreamQueue, WriteQueue},
    server::{self, AppState},
    worker::{DeadLetters, Reconciler, WorkerPool},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  feedline {}", env!("CARGO_PKG_VERSION"));
    info!("  build {} ({})", env!("GIT_COMMIT_SHORT"), env!("BUILD_TIMESTAMP"));
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {}", args.nats.nats_url);
    info!("MongoDB: {} (db {})", args.mongodb_uri, args.mongodb_db);
    info!("Step timeout: {}ms", args.step_timeout_ms);
    info!("======================================");

    // NATS (optional in dev mode)
    let nats = match NatsClient::new(&args.nats, &format!("feedline-{}", args.node_id)).await {
        Ok(client) => Some(client),
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, using in-process queue): {}", e);
                None
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // MongoDB backs the in-process pool. With JetStream the worker binary owns
    // persistence and the store here only serves cache misses.
    let store: Option<Arc<dyn DurableStore>> =
        match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(client) => Some(Arc::new(MongoStore::new(client)) as Arc<dyn DurableStore>),
            Err(e) if nats.is_some() => {
                warn!("MongoDB connection failed, cache misses will not read through: {}", e);
                None
            }
            Err(e) => {
                warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                Some(Arc::new(MemoryStore::new()) as Arc<dyn DurableStore>)
            }
        };

    let cache = Arc::new(MemoryCache::new(CacheConfig::from_env()));
    let hub = Arc::new(SocketHub::default());
    let dead_letters = Arc::new(DeadLetters::new());

    let (queue, pool): (Arc<dyn WriteQueue>, Option<Arc<WorkerPool>>) = match &nats {
        Some(client) => {
            let queue = JetStreamQueue::new(
                client,
                JetStreamQueueConfig {
                    enqueue_timeout: args.step_timeout(),
                    ..Default::default()
                },
            )
            .await?;
            info!("Durable writes go to JetStream; run feedline-worker to persist them");
            let queue: Arc<dyn WriteQueue> = Arc::new(queue);
            (queue, None)
        }
        None => {
            let store = store
                .clone()
                .ok_or_else(|| anyhow::anyhow!("in-process queue needs a durable store"))?;
            let pool = Arc::new(WorkerPool::start(
                args.pool_config(),
                Reconciler::new(store),
                Arc::clone(&dead_letters),
            ));
            let queue: Arc<dyn WriteQueue> = pool.clone();
            (queue, Some(pool))
        }
    };

    let mut relay_active = false;
    let broadcaster: Arc<dyn Broadcaster> = match (&nats, args.relay_enabled) {
        (Some(client), true) => {
            let relay = NatsRelay::new(Arc::clone(&hub), client.clone(), args.node_id.to_string());
            let _listener = relay.spawn_listener().await?;
            relay_active = true;
            Arc::new(relay) as Arc<dyn Broadcaster>
        }
        _ => hub.clone() as Arc<dyn Broadcaster>,
    };

    let services = Services {
        cache: cache.clone(),
        broadcaster,
        queue,
        store: store.clone(),
    };
    let uploader = Arc::new(HttpUploader::new(args.media_upload_url.clone())?);

    let mut state = AppState::new(args, cache, hub, services, uploader, dead_letters)
        .with_store_backend(store.as_ref().map_or("none", |s| s.backend()))
        .with_relay(relay_active);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }

    server::run(Arc::new(state)).await?;
    Ok(())
}
