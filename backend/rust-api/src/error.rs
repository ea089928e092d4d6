use thiserror::Error;

use crate::models::AttemptState;

/// Failures reported by a durable store adapter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The request never reached the store; nothing was applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The deadline passed with the outcome unknown.
    #[error("store operation `{operation}` timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt attempt document: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Only failures known not to have applied may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match *err.kind {
            ErrorKind::ServerSelection { .. } | ErrorKind::DnsResolve { .. } => {
                StoreError::Unavailable(err.to_string())
            }
            ErrorKind::BsonDeserialization(_) => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("version mismatch: attempt {} is at version {}", .latest.attempt_id, .latest.version)]
    VersionMismatch { latest: Box<AttemptState> },
    #[error("attempt {0} not found")]
    AttemptNotFound(String),
    #[error("attempt {0} is closed")]
    AttemptClosed(String),
    #[error("invalid batch data: {0}")]
    InvalidBatchData(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transient store error: {source}")]
    TransientStore {
        source: StoreError,
        outcome_unknown: bool,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::VersionMismatch { .. } => "version_mismatch",
            SyncError::AttemptNotFound(_) => "attempt_not_found",
            SyncError::AttemptClosed(_) => "attempt_closed",
            SyncError::InvalidBatchData(_) => "invalid_batch_data",
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::TransientStore { .. } => "transient_store_error",
            SyncError::Internal(_) => "internal_error",
        }
    }

    pub fn mismatch(latest: AttemptState) -> Self {
        SyncError::VersionMismatch {
            latest: Box::new(latest),
        }
    }

    pub fn latest_state(&self) -> Option<&AttemptState> {
        match self {
            SyncError::VersionMismatch { latest } => Some(latest),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(msg) => SyncError::Internal(msg),
            StoreError::Timeout { .. } => SyncError::TransientStore {
                source: err,
                outcome_unknown: true,
            },
            other => SyncError::TransientStore {
                source: other,
                outcome_unknown: false,
            },
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
