#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use examsync_api::{
    config::{Config, SyncSettings},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::AttemptState,
    services::{
        state_cache::InMemoryStateCache,
        state_store::{AttemptStore, InMemoryAttemptStore},
        AppState,
    },
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub const TEST_SECRET: &str = "integration-test-secret";

pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemoryAttemptStore>,
    pub cache: Arc<InMemoryStateCache>,
    pub state: Arc<AppState>,
}

pub fn test_config() -> Config {
    Config {
        jwt_secret: TEST_SECRET.to_string(),
        sync: SyncSettings {
            autosave_interval_ms: 40,
            store_timeout_ms: 1000,
            store_retry_backoff_ms: 1,
            max_batch_items: 10,
            ..SyncSettings::default()
        },
        ..Config::default()
    }
}

/// Router wired to in-memory store and cache, seeded with `attempt_ids` at version 1.
pub async fn create_test_app(attempt_ids: &[&str]) -> TestApp {
    create_test_app_with(test_config(), attempt_ids).await
}

pub async fn create_test_app_with(config: Config, attempt_ids: &[&str]) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(InMemoryAttemptStore::new());
    for id in attempt_ids {
        store
            .insert_state(AttemptState::new(*id))
            .await
            .expect("seed attempt");
    }
    let cache = Arc::new(InMemoryStateCache::new());

    let state = Arc::new(AppState::from_parts(config, store.clone(), cache.clone()));
    TestApp {
        router: create_router(state.clone()),
        store,
        cache,
        state,
    }
}

pub fn bearer_token(actor: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        sub: actor.to_string(),
        role: "student".to_string(),
        exp: (now + 3600) as usize,
        iat: now as usize,
    };
    JwtService::new(TEST_SECRET)
        .generate_token(&claims)
        .expect("sign test token")
}

impl TestApp {
    /// Sends one request to `/api/v1/attempts/{id}?action=...` and returns the
    /// status with the parsed JSON body (`Value::Null` for empty bodies).
    pub async fn call(
        &self,
        method: Method,
        attempt_id: &str,
        action: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let uri = match action {
            Some(action) => format!("/api/v1/attempts/{}?action={}", attempt_id, action),
            None => format!("/api/v1/attempts/{}", attempt_id),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer_token("student-1")))
            .header(header::CONTENT_TYPE, "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
