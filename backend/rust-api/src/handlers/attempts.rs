use axum::{
    body::Bytes,
    extract::{Extension, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use super::commands::{ActionQuery, AttemptAction, AttemptCommand};
use crate::error::SyncError;
use crate::middlewares::auth::JwtClaims;
use crate::middlewares::trace::RequestTraceContext;
use crate::services::AppState;

#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    BadRequest(String),
    MethodNotAllowed {
        action: &'static str,
        expected: Method,
    },
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

fn sync_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::VersionMismatch { .. } | SyncError::AttemptClosed(_) => StatusCode::CONFLICT,
        SyncError::AttemptNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::InvalidBatchData(_) | SyncError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SyncError::TransientStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Sync(err) => {
                let status = sync_status(&err);
                if status.is_server_error() {
                    tracing::error!(code = err.code(), "Attempt action failed: {}", err);
                }
                let mut body = serde_json::json!({
                    "error": err.code(),
                    "message": err.to_string(),
                });
                if let Some(latest) = err.latest_state() {
                    body["latest"] = serde_json::to_value(latest).unwrap_or_default();
                }
                (status, Json(body)).into_response()
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            ApiError::MethodNotAllowed { action, expected } => {
                let mut response = (
                    StatusCode::METHOD_NOT_ALLOWED,
                    Json(serde_json::json!({
                        "error": "method_not_allowed",
                        "message": format!("action `{}` requires {}", action, expected),
                    })),
                )
                    .into_response();
                if let Ok(allow) = HeaderValue::from_str(expected.as_str()) {
                    response.headers_mut().insert(header::ALLOW, allow);
                }
                response
            }
        }
    }
}

/// GET|PATCH|POST /api/v1/attempts/{id}?action=...
pub async fn attempt_action(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    Query(query): Query<ActionQuery>,
    method: Method,
    Extension(claims): Extension<JwtClaims>,
    Extension(trace): Extension<RequestTraceContext>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let action = AttemptAction::resolve(query.action.as_deref(), &method)?;
    let command = AttemptCommand::parse(action, &body)?;

    tracing::debug!(
        attempt_id = %attempt_id,
        action = action.as_str(),
        op = command.label(),
        actor = %claims.sub,
        trace_id = %trace.trace_id,
        "Dispatching attempt action"
    );

    command.execute(&state.attempts, &attempt_id, &claims).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttemptState;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn version_mismatch_carries_latest_state() {
        let mut latest = AttemptState::new("a");
        latest.version = 4;
        let response = ApiError::from(SyncError::mismatch(latest)).into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "version_mismatch");
        assert_eq!(body["latest"]["version"], 4);
    }

    #[tokio::test]
    async fn closed_and_missing_attempts_map_to_distinct_statuses() {
        let closed = ApiError::from(SyncError::AttemptClosed("a".into())).into_response();
        assert_eq!(closed.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(closed).await["error"], "attempt_closed");

        let missing = ApiError::from(SyncError::AttemptNotFound("a".into())).into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn method_mismatch_sets_allow_header() {
        let response = ApiError::MethodNotAllowed {
            action: "save",
            expected: Method::PATCH,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "PATCH");
    }
}
