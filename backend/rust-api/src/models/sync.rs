use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{AnswerValue, AttemptState};

/// Field-level edit emitted by a client. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub question_id: String,
    pub value: AnswerValue,
    #[serde(default)]
    pub client_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub origin_connection_id: Option<String>,
}

impl ChangeEvent {
    pub fn new(question_id: impl Into<String>, value: impl Into<AnswerValue>) -> Self {
        Self {
            question_id: question_id.into(),
            value: value.into(),
            client_timestamp: None,
            origin_connection_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Client value wins unconditionally.
    Local,
    /// Server value wins, the local edit is discarded.
    Server,
    /// Local value wins when present, otherwise the server value.
    #[default]
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Server => "server",
            ConflictStrategy::Merge => "merge",
        }
    }
}

/// Per-request overrides of the auto-save tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoSaveOverrides {
    pub interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub batch_size: Option<usize>,
    pub conflict_strategy: Option<ConflictStrategy>,
}

/// Audit record of one field decided by a conflict strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub question_id: String,
    pub strategy: ConflictStrategy,
    pub local_value: Option<AnswerValue>,
    pub server_value: Option<AnswerValue>,
    pub resolved_value: Option<AnswerValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSaveOutcome {
    pub success: bool,
    pub version: i64,
    pub conflicts: Vec<ResolvedConflict>,
    pub coalesced_changes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Synced,
    Conflict,
    Disconnected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Synced => "synced",
            SessionState::Conflict => "conflict",
            SessionState::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub connection_id: String,
    pub attempt_id: String,
    pub last_known_version: i64,
    pub last_sync_at: DateTime<Utc>,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Local changes were committed on top of the version the client held.
    Synced { version: i64, applied_changes: usize },
    /// The client is behind; it must resolve each returned change and resubmit.
    Conflict {
        server_state: AttemptState,
        unresolved_changes: Vec<ChangeEvent>,
    },
    /// Authoritative state re-fetched without applying anything.
    Refreshed { state: AttemptState },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub connection_id: String,
    pub state: SessionState,
    pub last_known_version: i64,
    pub last_sync_at: DateTime<Utc>,
    pub in_sync: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub attempt_id: String,
    pub server_version: i64,
    pub completion_status: super::attempt::CompletionStatus,
    pub sessions: Vec<SessionView>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub sessions_total: usize,
    pub connecting: usize,
    pub synced: usize,
    pub conflict: usize,
    pub monitored_attempts: usize,
    pub pending_autosave_batches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub session: SyncSession,
    pub state: AttemptState,
}
