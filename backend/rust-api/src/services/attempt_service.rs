use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use super::autosave_batcher::AutoSaveBatcher;
use super::batch_executor::BatchExecutor;
use super::concurrency::ConcurrencyController;
use super::conflict_resolver::resolve_recorded;
use super::sync_session_manager::SessionManager;
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::models::activity::{ActivityEvent, ActivityRecord};
use crate::models::api::{
    ActivityResponse, BatchRequest, BatchResponse, ForceSyncRequest, OptimizedSaveRequest,
    RealtimeRequest, RealtimeResponse, ResolveConflictRequest, ResolveConflictResponse,
    SaveRequest, SaveResponse, SubmitResponse,
};
use crate::models::attempt::validate_field_key;
use crate::models::sync::AutoSaveOutcome;
use crate::models::{AttemptState, CompletionStatus, StatePatch, SyncOutcome};

/// Entry point for every attempt action. Owns no state of its own; it wires
/// requests to the engine components.
pub struct AttemptService {
    controller: Arc<ConcurrencyController>,
    batcher: Arc<AutoSaveBatcher>,
    sessions: Arc<SessionManager>,
    batch: BatchExecutor,
    settings: SyncSettings,
}

impl AttemptService {
    pub fn new(
        controller: Arc<ConcurrencyController>,
        batcher: Arc<AutoSaveBatcher>,
        sessions: Arc<SessionManager>,
        settings: SyncSettings,
    ) -> Self {
        let batch = BatchExecutor::new(
            controller.clone(),
            sessions.clone(),
            settings.max_batch_items,
        );
        Self {
            controller,
            batcher,
            sessions,
            batch,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn batcher(&self) -> &Arc<AutoSaveBatcher> {
        &self.batcher
    }

    fn write_attempts(&self) -> u32 {
        self.settings.autosave_max_retries + 1
    }

    pub async fn state(&self, attempt_id: &str) -> SyncResult<AttemptState> {
        self.controller.read_cached(attempt_id).await
    }

    pub async fn save(&self, attempt_id: &str, req: SaveRequest) -> SyncResult<SaveResponse> {
        let patch = StatePatch {
            answers: req.answers,
            auto_save_data: req.auto_save_data,
            completion_status: None,
        };
        let receipt = self
            .controller
            .save(attempt_id, &patch, req.expected_version)
            .await?;
        Ok(SaveResponse {
            new_version: receipt.new_version,
        })
    }

    pub async fn optimized_save(
        &self,
        attempt_id: &str,
        req: OptimizedSaveRequest,
    ) -> SyncResult<AutoSaveOutcome> {
        self.batcher
            .enqueue(
                attempt_id,
                req.changes,
                req.expected_version,
                req.config.as_ref(),
            )?
            .outcome()
            .await
    }

    /// Applies a client-chosen resolution for one field. The write always goes
    /// through a fresh version read; a concurrent bump triggers a re-read.
    pub async fn resolve_conflict(
        &self,
        attempt_id: &str,
        req: ResolveConflictRequest,
    ) -> SyncResult<ResolveConflictResponse> {
        validate_field_key(&req.question_id).map_err(SyncError::InvalidRequest)?;
        let decision = resolve_recorded(
            &req.question_id,
            req.local_value.as_ref(),
            req.server_value.as_ref(),
            req.resolution,
        );

        let mut last_conflict = None;
        for _ in 0..self.write_attempts() {
            let current = self.controller.read(attempt_id).await?;
            if current.is_closed() {
                return Err(SyncError::AttemptClosed(attempt_id.to_string()));
            }

            let Some(value) = decision.resolved_value.clone() else {
                // Nothing to write: the field keeps whatever the server has.
                return Ok(ResolveConflictResponse {
                    success: true,
                    version: current.version,
                    resolved_answer: None,
                });
            };
            if current.answers.get(&req.question_id) == Some(&value) {
                return Ok(ResolveConflictResponse {
                    success: true,
                    version: current.version,
                    resolved_answer: Some(value),
                });
            }

            let mut patch = StatePatch::default();
            patch.answers.insert(req.question_id.clone(), value.clone());
            match self.controller.save(attempt_id, &patch, current.version).await {
                Ok(receipt) => {
                    return Ok(ResolveConflictResponse {
                        success: true,
                        version: receipt.new_version,
                        resolved_answer: Some(value),
                    })
                }
                Err(SyncError::VersionMismatch { latest }) => last_conflict = Some(*latest),
                Err(err) => return Err(err),
            }
        }

        Err(match last_conflict {
            Some(latest) => SyncError::mismatch(latest),
            None => SyncError::Internal("resolution made no attempt".into()),
        })
    }

    /// With buffered changes this is a synchronize; without, a forced refresh.
    pub async fn force_sync(&self, attempt_id: &str, req: ForceSyncRequest) -> SyncResult<SyncOutcome> {
        let connection_id = req.connection_id.as_deref();
        if let Some(connection_id) = connection_id {
            self.sessions.heartbeat(connection_id).await;
        }

        match (req.local_version, req.pending_changes) {
            (Some(local_version), Some(changes)) if !changes.is_empty() => {
                self.sessions
                    .synchronize(attempt_id, connection_id, local_version, changes)
                    .await
            }
            (None, Some(changes)) if !changes.is_empty() => Err(SyncError::InvalidRequest(
                "pendingChanges require localVersion".into(),
            )),
            _ => {
                let state = self.sessions.force_synchronization(attempt_id).await?;
                Ok(SyncOutcome::Refreshed { state })
            }
        }
    }

    pub async fn realtime(
        &self,
        attempt_id: &str,
        req: RealtimeRequest,
    ) -> SyncResult<RealtimeResponse> {
        if let Some(connection_id) = req.connection_id() {
            self.sessions.heartbeat(connection_id).await;
        }

        let response = match req {
            RealtimeRequest::InitMonitoring { connection_id } => RealtimeResponse::Monitoring(
                self.sessions.initialize(attempt_id, &connection_id).await?,
            ),
            RealtimeRequest::AutoSave {
                connection_id,
                changes,
                expected_version,
                config,
            } => {
                let outcome = self
                    .batcher
                    .enqueue(attempt_id, changes, expected_version, config.as_ref())?
                    .outcome()
                    .await?;
                if let Some(connection_id) = connection_id {
                    self.sessions
                        .acknowledge(attempt_id, &connection_id, outcome.version)
                        .await;
                }
                RealtimeResponse::AutoSave(outcome)
            }
            RealtimeRequest::Synchronize {
                connection_id,
                local_version,
                changes,
            } => RealtimeResponse::Sync(
                self.sessions
                    .synchronize(attempt_id, connection_id.as_deref(), local_version, changes)
                    .await?,
            ),
            RealtimeRequest::SyncStatus { .. } => {
                RealtimeResponse::Status(self.sessions.sync_status(attempt_id).await?)
            }
            RealtimeRequest::ForceSync { .. } => {
                let state = self.sessions.force_synchronization(attempt_id).await?;
                RealtimeResponse::Sync(SyncOutcome::Refreshed { state })
            }
            RealtimeRequest::Stats => RealtimeResponse::Stats(
                self.sessions
                    .stats(self.batcher.pending_batches())
                    .await,
            ),
            RealtimeRequest::Disconnect { connection_id } => RealtimeResponse::Disconnected {
                disconnected: self.sessions.disconnect(&connection_id).await.is_some(),
            },
        };
        Ok(response)
    }

    pub async fn batch(&self, req: BatchRequest, actor_id: Option<&str>) -> SyncResult<BatchResponse> {
        Ok(match req {
            BatchRequest::BatchSave { items } => {
                BatchResponse::Report(self.batch.batch_save(items).await?)
            }
            BatchRequest::BatchActivity { items } => {
                BatchResponse::Report(self.batch.batch_activity(items, actor_id).await?)
            }
            BatchRequest::MultipleStates { attempt_ids } => BatchResponse::States {
                results: self.batch.multiple_states(attempt_ids).await?,
            },
            BatchRequest::MultipleInfo { attempt_ids } => BatchResponse::Info {
                results: self.batch.multiple_info(attempt_ids).await?,
            },
            BatchRequest::ValidateMultiple { attempt_ids } => BatchResponse::Validations {
                results: self.batch.validate_multiple(attempt_ids).await?,
            },
        })
    }

    /// Appends activity events. Never bumps `version`.
    pub async fn activity(
        &self,
        attempt_id: &str,
        events: Vec<ActivityEvent>,
        actor_id: Option<&str>,
    ) -> SyncResult<ActivityResponse> {
        if events.len() > self.settings.max_batch_items {
            return Err(SyncError::InvalidRequest(format!(
                "at most {} events per call",
                self.settings.max_batch_items
            )));
        }
        for event in &events {
            event
                .validate()
                .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
        }

        self.controller.read(attempt_id).await?;
        let records: Vec<ActivityRecord> = events
            .into_iter()
            .map(|event| ActivityRecord::from_event(attempt_id, actor_id, event))
            .collect();
        let inserted_count = self.controller.append_activity(records).await?;

        Ok(ActivityResponse { inserted_count })
    }

    /// Flushes pending auto-save changes, then closes the attempt.
    pub async fn submit(&self, attempt_id: &str, actor_id: Option<&str>) -> SyncResult<SubmitResponse> {
        if let Some(Err(err)) = self.batcher.flush(attempt_id).await {
            warn!(attempt_id, "Pending auto-save failed before submit: {}", err);
            return Err(err);
        }

        let receipt = self
            .controller
            .close_attempt(attempt_id, CompletionStatus::Submitted, self.write_attempts())
            .await?;
        info!(
            attempt_id,
            actor_id = actor_id.unwrap_or("unknown"),
            version = receipt.new_version,
            "Attempt submitted"
        );

        Ok(SubmitResponse {
            success: true,
            version: receipt.new_version,
            completion_status: receipt.state.completion_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerValue, ChangeEvent, ConflictStrategy};
    use crate::services::autosave_batcher::AutoSaveConfig;
    use crate::services::state_cache::InMemoryStateCache;
    use crate::services::state_store::{AttemptStore, InMemoryAttemptStore, VersionedStateStore};
    use crate::utils::retry::RetryConfig;
    use std::time::Duration;

    async fn service() -> (AttemptService, Arc<InMemoryAttemptStore>) {
        let store = Arc::new(InMemoryAttemptStore::new());
        store.insert_state(AttemptState::new("a")).await.unwrap();
        let settings = SyncSettings {
            autosave_interval_ms: 60_000,
            ..SyncSettings::default()
        };
        let controller = Arc::new(ConcurrencyController::new(
            VersionedStateStore::new(store.clone(), Duration::from_secs(1)),
            Arc::new(InMemoryStateCache::new()),
            RetryConfig::default(),
        ));
        let batcher = Arc::new(AutoSaveBatcher::new(
            controller.clone(),
            AutoSaveConfig::from_settings(&settings),
        ));
        let sessions = Arc::new(SessionManager::new(controller.clone(), settings.session_ttl()));
        (
            AttemptService::new(controller, batcher, sessions, settings),
            store,
        )
    }

    fn resolution(
        strategy: ConflictStrategy,
        local: Option<&str>,
        server: Option<&str>,
    ) -> ResolveConflictRequest {
        ResolveConflictRequest {
            question_id: "q1".into(),
            resolution: strategy,
            local_value: local.map(AnswerValue::from),
            server_value: server.map(AnswerValue::from),
        }
    }

    #[tokio::test]
    async fn resolve_conflict_writes_merged_value() {
        let (service, _) = service().await;
        let resp = service
            .resolve_conflict("a", resolution(ConflictStrategy::Merge, Some("X"), Some("Y")))
            .await
            .unwrap();
        assert_eq!(resp.version, 2);
        assert_eq!(resp.resolved_answer, Some(AnswerValue::from("X")));
        assert_eq!(
            service.state("a").await.unwrap().answers["q1"],
            AnswerValue::from("X")
        );
    }

    #[tokio::test]
    async fn resolve_conflict_skips_write_when_value_already_stored() {
        let (service, store) = service().await;
        service
            .resolve_conflict("a", resolution(ConflictStrategy::Local, Some("X"), None))
            .await
            .unwrap();
        let again = service
            .resolve_conflict("a", resolution(ConflictStrategy::Server, Some("Z"), Some("X")))
            .await
            .unwrap();
        assert_eq!(again.version, 2);
        assert_eq!(store.committed_writes(), 1);
    }

    #[tokio::test]
    async fn submit_flushes_pending_changes_first() {
        let (service, _) = service().await;
        let pending = service
            .batcher()
            .enqueue("a", vec![ChangeEvent::new("q1", "last minute")], None, None)
            .unwrap();

        let submitted = service.submit("a", Some("student-1")).await.unwrap();
        assert_eq!(submitted.version, 3);
        assert_eq!(submitted.completion_status, CompletionStatus::Submitted);
        assert_eq!(pending.outcome().await.unwrap().version, 2);

        let state = service.state("a").await.unwrap();
        assert_eq!(state.answers["q1"], AnswerValue::from("last minute"));

        let err = service.submit("a", None).await.unwrap_err();
        assert_eq!(err.code(), "attempt_closed");
    }

    #[tokio::test]
    async fn submit_waits_for_auto_save_already_committing() {
        let (service, store) = service().await;
        store.set_delay_after_write(Duration::from_millis(80));
        let overrides = crate::models::sync::AutoSaveOverrides {
            interval_ms: Some(10),
            ..Default::default()
        };
        let pending = service
            .batcher()
            .enqueue("a", vec![ChangeEvent::new("q1", "typed")], None, Some(&overrides))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let submitted = service.submit("a", None).await.unwrap();
        assert_eq!(submitted.version, 3);
        assert_eq!(pending.outcome().await.unwrap().version, 2);
        let state = service.state("a").await.unwrap();
        assert_eq!(state.answers["q1"], AnswerValue::from("typed"));
        assert!(state.is_closed());
    }

    #[tokio::test]
    async fn activity_leaves_version_alone() {
        let (service, store) = service().await;
        let events = vec![ActivityEvent {
            kind: "tab_hidden".into(),
            payload: serde_json::Value::Null,
            occurred_at: None,
        }];
        let resp = service.activity("a", events, Some("student-1")).await.unwrap();
        assert_eq!(resp.inserted_count, 1);
        assert_eq!(service.state("a").await.unwrap().version, 1);
        assert_eq!(store.activity_records()[0].attempt_id, "a");

        let err = service.activity("ghost", vec![], None).await.unwrap_err();
        assert_eq!(err.code(), "attempt_not_found");
    }

    #[tokio::test]
    async fn force_sync_without_changes_refreshes() {
        let (service, _) = service().await;
        let first = service.force_sync("a", ForceSyncRequest::default()).await.unwrap();
        let second = service.force_sync("a", ForceSyncRequest::default()).await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(first, SyncOutcome::Refreshed { .. }));
    }
}
