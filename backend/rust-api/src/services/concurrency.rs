use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::state_cache::StateCache;
use super::state_store::{ConditionalWrite, VersionedStateStore, WriteOutcome};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::metrics::SAVES_TOTAL;
use crate::models::activity::ActivityRecord;
use crate::models::{AttemptState, CompletionStatus, StatePatch};
use crate::utils::retry::{retry_async_when, RetryConfig};

#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub new_version: i64,
    pub state: AttemptState,
}

/// Compare-and-swap writes on the attempt version.
///
/// Conflicts are returned to the caller as `SyncError::VersionMismatch` and are
/// never retried here; only store failures known not to have applied are.
pub struct ConcurrencyController {
    store: VersionedStateStore,
    cache: Arc<dyn StateCache>,
    retry: RetryConfig,
}

impl ConcurrencyController {
    pub fn new(store: VersionedStateStore, cache: Arc<dyn StateCache>, retry: RetryConfig) -> Self {
        Self {
            store,
            cache,
            retry,
        }
    }

    pub fn store(&self) -> &VersionedStateStore {
        &self.store
    }

    pub async fn read(&self, attempt_id: &str) -> SyncResult<AttemptState> {
        let state = retry_async_when(
            self.retry.clone(),
            || self.store.read_state(attempt_id),
            StoreError::is_retryable,
        )
        .await?;
        state.ok_or_else(|| SyncError::AttemptNotFound(attempt_id.to_string()))
    }

    /// Reads many attempts in one store round trip. Unknown IDs are simply
    /// missing from the map.
    pub async fn read_many(
        &self,
        attempt_ids: &[String],
    ) -> SyncResult<HashMap<String, AttemptState>> {
        let states = retry_async_when(
            self.retry.clone(),
            || self.store.batch_read(attempt_ids),
            StoreError::is_retryable,
        )
        .await?;
        Ok(states)
    }

    /// Appends activity records; never touches the attempt version.
    pub async fn append_activity(&self, records: Vec<ActivityRecord>) -> SyncResult<usize> {
        let inserted = retry_async_when(
            self.retry.clone(),
            || self.store.append_activity(records.clone()),
            StoreError::is_retryable,
        )
        .await?;
        Ok(inserted)
    }

    /// Read through the state cache. Used by read-only callers; writers always
    /// read the store. The fill is version-guarded by the cache, so a read that
    /// loses a race with a commit cannot leave its older state behind.
    pub async fn read_cached(&self, attempt_id: &str) -> SyncResult<AttemptState> {
        if let Some(state) = self.cache.get(attempt_id).await {
            return Ok(state);
        }
        let state = self.read(attempt_id).await?;
        self.cache.put(&state).await;
        Ok(state)
    }

    pub async fn save(
        &self,
        attempt_id: &str,
        patch: &StatePatch,
        expected_version: i64,
    ) -> SyncResult<CommitReceipt> {
        patch.validate().map_err(SyncError::InvalidRequest)?;

        let outcome = retry_async_when(
            self.retry.clone(),
            || self.store.conditional_update(attempt_id, expected_version, patch),
            StoreError::is_retryable,
        )
        .await;

        self.settle(attempt_id, expected_version, outcome).await
    }

    /// Independent conditional writes in one store round trip. Items that hit a
    /// retryable store failure fall back to an individual `save`.
    pub async fn save_many(&self, writes: &[ConditionalWrite]) -> Vec<SyncResult<CommitReceipt>> {
        let mut results: Vec<Option<SyncResult<CommitReceipt>>> = Vec::with_capacity(writes.len());
        let mut sendable = Vec::new();
        let mut positions = Vec::new();

        for (idx, write) in writes.iter().enumerate() {
            match write.patch.validate() {
                Ok(()) => {
                    results.push(None);
                    sendable.push(write.clone());
                    positions.push(idx);
                }
                Err(e) => results.push(Some(Err(SyncError::InvalidRequest(e)))),
            }
        }

        let outcomes = self.store.batch_write(&sendable).await;
        for ((write, idx), outcome) in sendable.iter().zip(positions).zip(outcomes) {
            let settled = match outcome {
                Err(err) if err.is_retryable() => {
                    self.save(&write.attempt_id, &write.patch, write.expected_version)
                        .await
                }
                other => {
                    self.settle(&write.attempt_id, write.expected_version, other)
                        .await
                }
            };
            results[idx] = Some(settled);
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(SyncError::Internal("item not processed".into()))))
            .collect()
    }

    /// Moves an attempt to a terminal status. Re-reads and retries when another
    /// writer bumped the version first, up to `max_attempts` times.
    pub async fn close_attempt(
        &self,
        attempt_id: &str,
        status: CompletionStatus,
        max_attempts: u32,
    ) -> SyncResult<CommitReceipt> {
        let patch = StatePatch::status(status);
        let mut last_conflict = None;

        for _ in 0..max_attempts.max(1) {
            let current = self.read(attempt_id).await?;
            if current.is_closed() {
                return Err(SyncError::AttemptClosed(attempt_id.to_string()));
            }
            match self.save(attempt_id, &patch, current.version).await {
                Err(SyncError::VersionMismatch { latest }) => last_conflict = Some(*latest),
                other => return other,
            }
        }

        Err(match last_conflict {
            Some(latest) => SyncError::mismatch(latest),
            None => SyncError::Internal("close_attempt made no attempt".into()),
        })
    }

    async fn settle(
        &self,
        attempt_id: &str,
        expected_version: i64,
        outcome: Result<WriteOutcome, StoreError>,
    ) -> SyncResult<CommitReceipt> {
        match outcome {
            Ok(WriteOutcome::Committed(state)) => {
                SAVES_TOTAL.with_label_values(&["committed"]).inc();
                self.cache.invalidate(attempt_id).await;
                // Seeding the committed state fences off fills that read before it.
                self.cache.put(&state).await;
                info!(
                    attempt_id,
                    version = state.version,
                    "Attempt state committed"
                );
                Ok(CommitReceipt {
                    new_version: state.version,
                    state,
                })
            }
            Ok(WriteOutcome::VersionMismatch(latest)) => {
                SAVES_TOTAL.with_label_values(&["version_mismatch"]).inc();
                warn!(
                    attempt_id,
                    expected_version,
                    current_version = latest.version,
                    "Version mismatch on save"
                );
                Err(SyncError::mismatch(latest))
            }
            Ok(WriteOutcome::Closed(_)) => {
                SAVES_TOTAL.with_label_values(&["attempt_closed"]).inc();
                warn!(attempt_id, "Write rejected: attempt is closed");
                Err(SyncError::AttemptClosed(attempt_id.to_string()))
            }
            Ok(WriteOutcome::NotFound) => {
                SAVES_TOTAL.with_label_values(&["not_found"]).inc();
                Err(SyncError::AttemptNotFound(attempt_id.to_string()))
            }
            Err(err) => {
                SAVES_TOTAL.with_label_values(&["error"]).inc();
                tracing::error!(attempt_id, "Conditional write failed: {}", err);
                Err(err.into())
            }
        }
    }
}
