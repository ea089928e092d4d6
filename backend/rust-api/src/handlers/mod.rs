use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::services::AppState;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct DependencyHealth {
    healthy: bool,
    detail: String,
}

impl DependencyHealth {
    fn up(detail: &str) -> Self {
        Self {
            healthy: true,
            detail: detail.to_string(),
        }
    }

    fn down(detail: String) -> Self {
        Self {
            healthy: false,
            detail,
        }
    }
}

/// GET /health. 503 when the store or the cache does not answer; the body also
/// carries the engine's in-flight load.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = probe_store(&state).await;
    let cache = if state.cache.ping().await {
        DependencyHealth::up("state cache reachable")
    } else {
        DependencyHealth::down("state cache did not answer PING".to_string())
    };

    let all_healthy = store.healthy && cache.healthy;
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let stats = state
        .attempts
        .sessions()
        .stats(state.attempts.batcher().pending_batches())
        .await;

    (
        status_code,
        Json(json!({
            "status": if all_healthy { "healthy" } else { "degraded" },
            "service": "examsync-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": {
                "attempt_store": store,
                "state_cache": cache,
            },
            "sync": {
                "live_sessions": stats.sessions_total,
                "pending_autosave_batches": stats.pending_autosave_batches,
            },
        })),
    )
}

async fn probe_store(state: &AppState) -> DependencyHealth {
    match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, state.store.ping()).await {
        Ok(Ok(())) => DependencyHealth::up("attempt store reachable"),
        Ok(Err(e)) => DependencyHealth::down(format!("store error: {}", e)),
        Err(_) => DependencyHealth::down(format!(
            "store did not answer within {}ms",
            HEALTH_PROBE_TIMEOUT.as_millis()
        )),
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// Protects /metrics with HTTP Basic auth (`METRICS_AUTH=user:password`).
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let encoded = auth_header
        .strip_prefix("Basic ")
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let expected = std::env::var("METRICS_AUTH").unwrap_or_else(|_| "admin:changeme".to_string());
    if credentials != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

pub mod attempts;
pub mod commands;
