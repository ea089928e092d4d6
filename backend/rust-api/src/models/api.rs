use serde::{Deserialize, Deserializer, Serialize};

use super::activity::ActivityEvent;
use super::attempt::{AnswerMap, AnswerValue, CompletionStatus};
use super::batch::{
    AttemptInfo, AttemptValidation, BatchActivityEntry, BatchOperationResult, BatchReport,
    BatchSaveOp, StateLookup,
};
use super::sync::{
    AutoSaveOutcome, AutoSaveOverrides, ChangeEvent, ConflictStrategy, MonitoringSnapshot,
    SyncOutcome, SyncStatusReport, SyncStats,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub auto_save_data: AnswerMap,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResponse {
    pub new_version: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizedSaveRequest {
    pub changes: Vec<ChangeEvent>,
    #[serde(default)]
    pub config: Option<AutoSaveOverrides>,
    /// Version the client last saw; a fresh read is used when absent.
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// A left-out `localValue`/`serverValue` means "no value"; an explicit `null`
/// is a value like any other.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub question_id: String,
    pub resolution: ConflictStrategy,
    #[serde(default, deserialize_with = "present_value")]
    pub local_value: Option<AnswerValue>,
    #[serde(default, deserialize_with = "present_value")]
    pub server_value: Option<AnswerValue>,
}

/// Only called for keys that are present, so `null` becomes `Some(Null)`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<AnswerValue>, D::Error>
where
    D: Deserializer<'de>,
{
    AnswerValue::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictResponse {
    pub success: bool,
    pub version: i64,
    pub resolved_answer: Option<AnswerValue>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSyncRequest {
    #[serde(default)]
    pub local_version: Option<i64>,
    #[serde(default)]
    pub pending_changes: Option<Vec<ChangeEvent>>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActivityRequest {
    pub events: Vec<ActivityEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub inserted_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub version: i64,
    pub completion_status: CompletionStatus,
}

/// Live-monitoring sub-operations, selected by the `op` field.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RealtimeRequest {
    InitMonitoring {
        connection_id: String,
    },
    AutoSave {
        #[serde(default)]
        connection_id: Option<String>,
        changes: Vec<ChangeEvent>,
        #[serde(default)]
        expected_version: Option<i64>,
        #[serde(default)]
        config: Option<AutoSaveOverrides>,
    },
    Synchronize {
        #[serde(default)]
        connection_id: Option<String>,
        local_version: i64,
        #[serde(default)]
        changes: Vec<ChangeEvent>,
    },
    SyncStatus {
        #[serde(default)]
        connection_id: Option<String>,
    },
    ForceSync {
        #[serde(default)]
        connection_id: Option<String>,
    },
    Stats,
    Disconnect {
        connection_id: String,
    },
}

impl RealtimeRequest {
    pub fn op(&self) -> &'static str {
        match self {
            RealtimeRequest::InitMonitoring { .. } => "init_monitoring",
            RealtimeRequest::AutoSave { .. } => "auto_save",
            RealtimeRequest::Synchronize { .. } => "synchronize",
            RealtimeRequest::SyncStatus { .. } => "sync_status",
            RealtimeRequest::ForceSync { .. } => "force_sync",
            RealtimeRequest::Stats => "stats",
            RealtimeRequest::Disconnect { .. } => "disconnect",
        }
    }

    /// Connection whose heartbeat this call refreshes.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            RealtimeRequest::AutoSave { connection_id, .. }
            | RealtimeRequest::Synchronize { connection_id, .. }
            | RealtimeRequest::SyncStatus { connection_id }
            | RealtimeRequest::ForceSync { connection_id } => connection_id.as_deref(),
            RealtimeRequest::InitMonitoring { .. }
            | RealtimeRequest::Stats
            | RealtimeRequest::Disconnect { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RealtimeResponse {
    Monitoring(MonitoringSnapshot),
    AutoSave(AutoSaveOutcome),
    Sync(SyncOutcome),
    Status(SyncStatusReport),
    Stats(SyncStats),
    Disconnected { disconnected: bool },
}

/// Multi-attempt operations, selected by the `op` field.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchRequest {
    BatchSave { items: Vec<BatchSaveOp> },
    BatchActivity { items: Vec<BatchActivityEntry> },
    MultipleStates { attempt_ids: Vec<String> },
    MultipleInfo { attempt_ids: Vec<String> },
    ValidateMultiple { attempt_ids: Vec<String> },
}

impl BatchRequest {
    pub fn op(&self) -> &'static str {
        match self {
            BatchRequest::BatchSave { .. } => "batch_save",
            BatchRequest::BatchActivity { .. } => "batch_activity",
            BatchRequest::MultipleStates { .. } => "multiple_states",
            BatchRequest::MultipleInfo { .. } => "multiple_info",
            BatchRequest::ValidateMultiple { .. } => "validate_multiple",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchResponse {
    Report(BatchReport<BatchOperationResult>),
    States { results: Vec<StateLookup> },
    Info { results: Vec<AttemptInfo> },
    Validations { results: Vec<AttemptValidation> },
}
