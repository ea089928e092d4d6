use crate::config::Config;
use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;
use std::sync::Arc;

use attempt_service::AttemptService;
use autosave_batcher::{AutoSaveBatcher, AutoSaveConfig};
use concurrency::ConcurrencyController;
use mongo_store::MongoAttemptStore;
use state_cache::{RedisStateCache, StateCache};
use state_store::{AttemptStore, VersionedStateStore};
use sync_session_manager::SessionManager;

use crate::utils::retry::RetryConfig;

pub struct AppState {
    pub config: Config,
    pub store: VersionedStateStore,
    pub cache: Arc<dyn StateCache>,
    pub attempts: AttemptService,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);
        let store = MongoAttemptStore::new(mongo);
        store.ensure_indexes().await?;

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let cache = RedisStateCache::new(redis, config.sync.cache_ttl_secs);
        Ok(Self::from_parts(config, Arc::new(store), Arc::new(cache)))
    }

    /// Wires the engine around any store and cache. Tests pass in-memory ones.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn AttemptStore>,
        cache: Arc<dyn StateCache>,
    ) -> Self {
        let settings = config.sync.clone();
        let store = VersionedStateStore::new(store, settings.store_timeout());
        let controller = Arc::new(ConcurrencyController::new(
            store.clone(),
            cache.clone(),
            RetryConfig::for_store(&settings),
        ));
        let batcher = Arc::new(AutoSaveBatcher::new(
            controller.clone(),
            AutoSaveConfig::from_settings(&settings),
        ));
        let sessions = Arc::new(SessionManager::new(
            controller.clone(),
            settings.session_ttl(),
        ));
        let attempts = AttemptService::new(controller, batcher, sessions, settings);

        Self {
            config,
            store,
            cache,
            attempts,
        }
    }

    /// Starts the idle-session sweeper. Needs a running tokio runtime.
    pub fn spawn_background_tasks(&self) -> tokio::task::JoinHandle<()> {
        let sessions = self.attempts.sessions().clone();
        let interval = self.config.sync.session_sweep_interval();
        tokio::spawn(sessions.run_sweeper(interval))
    }
}

pub mod attempt_service;
pub mod autosave_batcher;
pub mod batch_executor;
pub mod concurrency;
pub mod conflict_resolver;
pub mod mongo_store;
pub mod state_cache;
pub mod state_store;
pub mod sync_session_manager;
