use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::metrics::{record_cache_hit, record_cache_miss, track_cache_operation};
use crate::models::AttemptState;

const CACHE_KEY_PREFIX: &str = "attempt_state:";

/// SETEX unless the cached entry already holds a newer version.
/// KEYS[1] = entry, ARGV = version, ttl, json.
const PUT_IF_NOT_OLDER: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, decoded = pcall(cjson.decode, current)
  if ok and type(decoded) == 'table' and tonumber(decoded['version']) ~= nil
     and tonumber(decoded['version']) > tonumber(ARGV[1]) then
    return 0
  end
end
redis.call('SETEX', KEYS[1], ARGV[2], ARGV[3])
return 1
"#;

fn cache_key(attempt_id: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, attempt_id)
}

/// Read-through cache of attempt state. Failures degrade to misses; the store
/// stays authoritative.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, attempt_id: &str) -> Option<AttemptState>;

    /// Stores `state` unless the entry already holds a newer version, so a
    /// slow read-through fill cannot replace a state committed after it.
    async fn put(&self, state: &AttemptState);

    /// Called after every successful commit for the attempt.
    async fn invalidate(&self, attempt_id: &str);

    async fn ping(&self) -> bool {
        true
    }
}

pub struct RedisStateCache {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisStateCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }
}

#[async_trait]
impl StateCache for RedisStateCache {
    async fn get(&self, attempt_id: &str) -> Option<AttemptState> {
        let mut conn = self.redis.clone();
        let key = cache_key(attempt_id);

        let cached: Result<Option<String>, redis::RedisError> = track_cache_operation("get", async {
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        })
        .await;

        match cached {
            Ok(Some(json)) => match serde_json::from_str::<AttemptState>(&json) {
                Ok(state) => {
                    record_cache_hit();
                    debug!(attempt_id, version = state.version, "state cache hit");
                    Some(state)
                }
                Err(e) => {
                    warn!(attempt_id, "Dropping undecodable cache entry: {}", e);
                    self.invalidate(attempt_id).await;
                    record_cache_miss();
                    None
                }
            },
            Ok(None) => {
                record_cache_miss();
                None
            }
            Err(e) => {
                warn!(attempt_id, "State cache read failed, falling back to store: {}", e);
                record_cache_miss();
                None
            }
        }
    }

    async fn put(&self, state: &AttemptState) {
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                warn!(attempt_id = %state.attempt_id, "Failed to serialize state for cache: {}", e);
                return;
            }
        };
        let mut conn = self.redis.clone();
        let key = cache_key(&state.attempt_id);

        let result: Result<i64, redis::RedisError> = track_cache_operation("setex", async {
            redis::cmd("EVAL")
                .arg(PUT_IF_NOT_OLDER)
                .arg(1)
                .arg(&key)
                .arg(state.version)
                .arg(self.ttl_secs)
                .arg(json)
                .query_async::<i64>(&mut conn)
                .await
        })
        .await;

        match result {
            Ok(0) => debug!(
                attempt_id = %state.attempt_id,
                version = state.version,
                "Cache already holds a newer state, fill skipped"
            ),
            Ok(_) => {}
            Err(e) => {
                warn!(attempt_id = %state.attempt_id, "Failed to cache attempt state: {}", e)
            }
        }
    }

    async fn invalidate(&self, attempt_id: &str) {
        let mut conn = self.redis.clone();
        let key = cache_key(attempt_id);

        let result: Result<(), redis::RedisError> = track_cache_operation("del", async {
            redis::cmd("DEL").arg(&key).query_async::<()>(&mut conn).await
        })
        .await;

        if let Err(e) = result {
            // Entry expires on its own after the TTL.
            warn!(attempt_id, "Failed to invalidate cached state: {}", e);
        }
    }

    async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_millis(500),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }
}

/// Process-local cache used by tests and single-node runs.
#[derive(Default)]
pub struct InMemoryStateCache {
    entries: Mutex<HashMap<String, AttemptState>>,
    invalidations: AtomicU64,
}

impl InMemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn contains(&self, attempt_id: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(attempt_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl StateCache for InMemoryStateCache {
    async fn get(&self, attempt_id: &str) -> Option<AttemptState> {
        let cached = self
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(attempt_id).cloned());
        if cached.is_some() {
            record_cache_hit();
        } else {
            record_cache_miss();
        }
        cached
    }

    async fn put(&self, state: &AttemptState) {
        if let Ok(mut entries) = self.entries.lock() {
            let newer_cached = entries
                .get(&state.attempt_id)
                .is_some_and(|cached| cached.version > state.version);
            if !newer_cached {
                entries.insert(state.attempt_id.clone(), state.clone());
            }
        }
    }

    async fn invalidate(&self, attempt_id: &str) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(attempt_id);
        }
    }
}
