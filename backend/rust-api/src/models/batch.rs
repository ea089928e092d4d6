use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::activity::ActivityEvent;
use super::attempt::{AnswerMap, AttemptState, CompletionStatus};

/// One item of a `batch_save` request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSaveOp {
    pub attempt_id: String,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub auto_save_data: AnswerMap,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchActivityEntry {
    pub attempt_id: String,
    pub events: Vec<ActivityEvent>,
}

/// Per-item outcome. A batch is never all-or-nothing; read each entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperationResult {
    pub attempt_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_count: Option<usize>,
}

impl BatchOperationResult {
    pub fn committed(attempt_id: impl Into<String>, new_version: i64) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            success: true,
            new_version: Some(new_version),
            error_code: None,
            inserted_count: None,
        }
    }

    /// Activity append; carries no version since activity never bumps it.
    pub fn recorded(attempt_id: impl Into<String>, inserted_count: usize) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            success: true,
            new_version: None,
            error_code: None,
            inserted_count: Some(inserted_count),
        }
    }

    pub fn failed(attempt_id: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            success: false,
            new_version: None,
            error_code: Some(error_code.into()),
            inserted_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport<T> {
    /// Conjunction of item outcomes, for reporting only.
    pub success: bool,
    pub results: Vec<T>,
}

impl BatchReport<BatchOperationResult> {
    pub fn from_results(results: Vec<BatchOperationResult>) -> Self {
        Self {
            success: results.iter().all(|r| r.success),
            results,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateLookup {
    pub attempt_id: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<AttemptState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptInfo {
    pub attempt_id: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_status: Option<CompletionStatus>,
    pub answered_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub live_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptValidation {
    pub attempt_id: String,
    pub exists: bool,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_status: Option<CompletionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}
