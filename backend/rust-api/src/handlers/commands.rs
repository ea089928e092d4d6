use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::attempts::ApiError;
use crate::middlewares::auth::JwtClaims;
use crate::models::api::{
    ActivityRequest, BatchRequest, ForceSyncRequest, OptimizedSaveRequest, RealtimeRequest,
    ResolveConflictRequest, SaveRequest,
};
use crate::services::attempt_service::AttemptService;

#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    pub action: Option<String>,
}

/// Action identifiers accepted on `/api/v1/attempts/{id}`. Each one is bound
/// to exactly one HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptAction {
    State,
    Save,
    OptimizedSave,
    ResolveConflict,
    ForceSync,
    Realtime,
    Batch,
    Activity,
    Submit,
}

impl AttemptAction {
    const ALL: [AttemptAction; 9] = [
        AttemptAction::State,
        AttemptAction::Save,
        AttemptAction::OptimizedSave,
        AttemptAction::ResolveConflict,
        AttemptAction::ForceSync,
        AttemptAction::Realtime,
        AttemptAction::Batch,
        AttemptAction::Activity,
        AttemptAction::Submit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptAction::State => "state",
            AttemptAction::Save => "save",
            AttemptAction::OptimizedSave => "optimized_save",
            AttemptAction::ResolveConflict => "resolve_conflict",
            AttemptAction::ForceSync => "force_sync",
            AttemptAction::Realtime => "realtime",
            AttemptAction::Batch => "batch",
            AttemptAction::Activity => "activity",
            AttemptAction::Submit => "submit",
        }
    }

    pub fn method(self) -> Method {
        match self {
            AttemptAction::State => Method::GET,
            AttemptAction::Save => Method::PATCH,
            _ => Method::POST,
        }
    }

    /// Resolves the action and checks the method it arrived with. A bare GET
    /// means `state`.
    pub fn resolve(raw: Option<&str>, method: &Method) -> Result<Self, ApiError> {
        let action = match raw {
            None | Some("") if *method == Method::GET => AttemptAction::State,
            None | Some("") => {
                return Err(ApiError::BadRequest("missing `action` query parameter".into()))
            }
            Some(name) => Self::ALL
                .into_iter()
                .find(|a| a.as_str() == name)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown action `{}`", name)))?,
        };

        if action.method() != *method {
            return Err(ApiError::MethodNotAllowed {
                action: action.as_str(),
                expected: action.method(),
            });
        }
        Ok(action)
    }
}

/// A parsed action with its typed payload.
#[derive(Debug)]
pub enum AttemptCommand {
    State,
    Save(SaveRequest),
    OptimizedSave(OptimizedSaveRequest),
    ResolveConflict(ResolveConflictRequest),
    ForceSync(ForceSyncRequest),
    Realtime(RealtimeRequest),
    Batch(BatchRequest),
    Activity(ActivityRequest),
    Submit,
}

fn json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        let message = format!("Failed to parse JSON request body: {}", e);
        tracing::warn!("{}", message);
        ApiError::BadRequest(message)
    })
}

fn optional_json_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        json_body(body)
    }
}

impl AttemptCommand {
    pub fn parse(action: AttemptAction, body: &[u8]) -> Result<Self, ApiError> {
        Ok(match action {
            AttemptAction::State => AttemptCommand::State,
            AttemptAction::Save => AttemptCommand::Save(json_body(body)?),
            AttemptAction::OptimizedSave => AttemptCommand::OptimizedSave(json_body(body)?),
            AttemptAction::ResolveConflict => AttemptCommand::ResolveConflict(json_body(body)?),
            AttemptAction::ForceSync => AttemptCommand::ForceSync(optional_json_body(body)?),
            AttemptAction::Realtime => AttemptCommand::Realtime(json_body(body)?),
            AttemptAction::Batch => AttemptCommand::Batch(json_body(body)?),
            AttemptAction::Activity => AttemptCommand::Activity(json_body(body)?),
            AttemptAction::Submit => AttemptCommand::Submit,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptCommand::State => "state",
            AttemptCommand::Save(_) => "save",
            AttemptCommand::OptimizedSave(_) => "optimized_save",
            AttemptCommand::ResolveConflict(_) => "resolve_conflict",
            AttemptCommand::ForceSync(_) => "force_sync",
            AttemptCommand::Realtime(req) => req.op(),
            AttemptCommand::Batch(req) => req.op(),
            AttemptCommand::Activity(_) => "activity",
            AttemptCommand::Submit => "submit",
        }
    }

    pub async fn execute(
        self,
        service: &AttemptService,
        attempt_id: &str,
        actor: &JwtClaims,
    ) -> Result<Response, ApiError> {
        let actor_id = Some(actor.sub.as_str());
        let response = match self {
            AttemptCommand::State => Json(service.state(attempt_id).await?).into_response(),
            AttemptCommand::Save(req) => Json(service.save(attempt_id, req).await?).into_response(),
            AttemptCommand::OptimizedSave(req) => {
                Json(service.optimized_save(attempt_id, req).await?).into_response()
            }
            AttemptCommand::ResolveConflict(req) => {
                Json(service.resolve_conflict(attempt_id, req).await?).into_response()
            }
            AttemptCommand::ForceSync(req) => {
                Json(service.force_sync(attempt_id, req).await?).into_response()
            }
            AttemptCommand::Realtime(req) => {
                Json(service.realtime(attempt_id, req).await?).into_response()
            }
            AttemptCommand::Batch(req) => Json(service.batch(req, actor_id).await?).into_response(),
            AttemptCommand::Activity(req) => (
                StatusCode::CREATED,
                Json(service.activity(attempt_id, req.events, actor_id).await?),
            )
                .into_response(),
            AttemptCommand::Submit => {
                Json(service.submit(attempt_id, actor_id).await?).into_response()
            }
        };
        Ok(response)
    }
}
