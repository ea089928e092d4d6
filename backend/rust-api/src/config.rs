use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::models::sync::ConflictStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub sync: SyncSettings,
}

/// Tunables of the attempt synchronization engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub autosave_interval_ms: u64,
    pub autosave_max_retries: u32,
    pub autosave_batch_size: usize,
    pub conflict_strategy: ConflictStrategy,
    pub session_ttl_secs: u64,
    pub session_sweep_secs: u64,
    pub store_timeout_ms: u64,
    pub store_max_retries: u32,
    pub store_retry_backoff_ms: u64,
    pub max_batch_items: usize,
    pub cache_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            autosave_interval_ms: 1500,
            autosave_max_retries: 3,
            autosave_batch_size: 50,
            conflict_strategy: ConflictStrategy::Merge,
            session_ttl_secs: 300,
            session_sweep_secs: 30,
            store_timeout_ms: 5000,
            store_max_retries: 2,
            store_retry_backoff_ms: 50,
            max_batch_items: 100,
            cache_ttl_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongo_uri: "mongodb://localhost:27017".to_string(),
            redis_uri: "redis://127.0.0.1:6379/0".to_string(),
            mongo_database: "examsync".to_string(),
            jwt_secret: "dev-secret-only-for-local-testing".to_string(),
            bind_addr: "0.0.0.0:8081".to_string(),
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then the crate-local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP__ overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let defaults = Config::default();

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or(defaults.mongo_uri);

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                match env::var("REDIS_PASSWORD") {
                    Ok(password) => format!("redis://:{}@{}:{}/0", password, host, port),
                    Err(_) => format!("redis://{}:{}/0", host, port),
                }
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or(defaults.mongo_database);

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!("Using default JWT_SECRET (dev mode only!)");
                defaults.jwt_secret
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or(defaults.bind_addr);

        let sync = match settings.get::<SyncSettings>("sync") {
            Ok(sync) => sync,
            Err(config::ConfigError::NotFound(_)) => SyncSettings::default(),
            Err(e) => return Err(e),
        };

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            bind_addr,
            sync,
        })
    }
}
