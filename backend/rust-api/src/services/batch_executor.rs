use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use super::concurrency::ConcurrencyController;
use super::state_store::ConditionalWrite;
use super::sync_session_manager::SessionManager;
use crate::error::{SyncError, SyncResult};
use crate::metrics::BATCH_ITEMS_TOTAL;
use crate::models::activity::ActivityRecord;
use crate::models::batch::{
    AttemptInfo, AttemptValidation, BatchActivityEntry, BatchOperationResult, BatchReport,
    BatchSaveOp, StateLookup,
};
use crate::models::{AttemptState, StatePatch};

/// Runs one operation over many attempts. Items never share a transaction:
/// each one commits or fails on its own.
pub struct BatchExecutor {
    controller: Arc<ConcurrencyController>,
    sessions: Arc<SessionManager>,
    max_items: usize,
}

impl BatchExecutor {
    pub fn new(
        controller: Arc<ConcurrencyController>,
        sessions: Arc<SessionManager>,
        max_items: usize,
    ) -> Self {
        Self {
            controller,
            sessions,
            max_items,
        }
    }

    /// Shape checks run before any item is touched.
    fn check_ids<'a>(&self, ids: impl ExactSizeIterator<Item = &'a str>) -> SyncResult<()> {
        let len = ids.len();
        if len == 0 {
            return Err(SyncError::InvalidBatchData(
                "batch must contain at least one item".into(),
            ));
        }
        if len > self.max_items {
            return Err(SyncError::InvalidBatchData(format!(
                "batch of {} items exceeds the limit of {}",
                len, self.max_items
            )));
        }
        for (idx, id) in ids.enumerate() {
            if id.trim().is_empty() {
                return Err(SyncError::InvalidBatchData(format!(
                    "item {} has an empty attempt_id",
                    idx
                )));
            }
        }
        Ok(())
    }

    pub async fn batch_save(
        &self,
        ops: Vec<BatchSaveOp>,
    ) -> SyncResult<BatchReport<BatchOperationResult>> {
        self.check_ids(ops.iter().map(|op| op.attempt_id.as_str()))?;

        let writes: Vec<ConditionalWrite> = ops
            .into_iter()
            .map(|op| ConditionalWrite {
                attempt_id: op.attempt_id,
                expected_version: op.expected_version,
                patch: StatePatch {
                    answers: op.answers,
                    auto_save_data: op.auto_save_data,
                    completion_status: None,
                },
            })
            .collect();

        let outcomes = self.controller.save_many(&writes).await;
        let results: Vec<BatchOperationResult> = writes
            .iter()
            .zip(outcomes)
            .map(|(write, outcome)| match outcome {
                Ok(receipt) => BatchOperationResult::committed(&write.attempt_id, receipt.new_version),
                Err(err) => BatchOperationResult::failed(&write.attempt_id, err.code()),
            })
            .collect();

        Ok(self.report("batch_save", results))
    }

    pub async fn batch_activity(
        &self,
        entries: Vec<BatchActivityEntry>,
        actor_id: Option<&str>,
    ) -> SyncResult<BatchReport<BatchOperationResult>> {
        self.check_ids(entries.iter().map(|e| e.attempt_id.as_str()))?;

        let ids: Vec<String> = entries.iter().map(|e| e.attempt_id.clone()).collect();
        let known = self.controller.read_many(&ids).await?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let attempt_id = entry.attempt_id.clone();
            if !known.contains_key(&attempt_id) {
                results.push(BatchOperationResult::failed(attempt_id, "attempt_not_found"));
                continue;
            }
            if entry.events.iter().any(|e| e.validate().is_err()) {
                results.push(BatchOperationResult::failed(attempt_id, "invalid_request"));
                continue;
            }

            let records: Vec<ActivityRecord> = entry
                .events
                .into_iter()
                .map(|event| ActivityRecord::from_event(&attempt_id, actor_id, event))
                .collect();
            match self.controller.append_activity(records).await {
                Ok(inserted) => results.push(BatchOperationResult::recorded(attempt_id, inserted)),
                Err(err) => {
                    warn!(attempt_id = %attempt_id, "Activity append failed: {}", err);
                    results.push(BatchOperationResult::failed(attempt_id, err.code()));
                }
            }
        }

        Ok(self.report("batch_activity", results))
    }

    pub async fn multiple_states(&self, attempt_ids: Vec<String>) -> SyncResult<Vec<StateLookup>> {
        let found = self.read_many(&attempt_ids).await?;
        let lookups = attempt_ids
            .into_iter()
            .map(|attempt_id| {
                let state = found.get(&attempt_id).cloned();
                self.count("multiple_states", state.is_some());
                StateLookup {
                    attempt_id,
                    found: state.is_some(),
                    state,
                }
            })
            .collect();
        Ok(lookups)
    }

    pub async fn multiple_info(&self, attempt_ids: Vec<String>) -> SyncResult<Vec<AttemptInfo>> {
        let found = self.read_many(&attempt_ids).await?;
        let live = self.sessions.live_session_counts().await;

        let infos = attempt_ids
            .into_iter()
            .map(|attempt_id| {
                let state = found.get(&attempt_id);
                self.count("multiple_info", state.is_some());
                AttemptInfo {
                    found: state.is_some(),
                    version: state.map(|s| s.version),
                    completion_status: state.map(|s| s.completion_status),
                    answered_count: state.map(|s| s.answers.len()).unwrap_or(0),
                    last_activity_at: state.map(|s| s.last_activity_at),
                    live_sessions: live.get(&attempt_id).copied().unwrap_or(0),
                    attempt_id,
                }
            })
            .collect();
        Ok(infos)
    }

    /// Read-only: reports existence and writability, never touches `version`.
    pub async fn validate_multiple(
        &self,
        attempt_ids: Vec<String>,
    ) -> SyncResult<Vec<AttemptValidation>> {
        let found = self.read_many(&attempt_ids).await?;
        let validations = attempt_ids
            .into_iter()
            .map(|attempt_id| {
                let validation = match found.get(&attempt_id) {
                    None => AttemptValidation {
                        attempt_id,
                        exists: false,
                        writable: false,
                        completion_status: None,
                        error_code: Some("attempt_not_found".into()),
                    },
                    Some(state) => AttemptValidation {
                        attempt_id,
                        exists: true,
                        writable: !state.is_closed(),
                        completion_status: Some(state.completion_status),
                        error_code: state.is_closed().then(|| "attempt_closed".to_string()),
                    },
                };
                self.count("validate_multiple", validation.writable);
                validation
            })
            .collect();
        Ok(validations)
    }

    async fn read_many(&self, attempt_ids: &[String]) -> SyncResult<HashMap<String, AttemptState>> {
        self.check_ids(attempt_ids.iter().map(String::as_str))?;
        self.controller.read_many(attempt_ids).await
    }

    fn count(&self, operation: &str, success: bool) {
        let status = if success { "success" } else { "failed" };
        BATCH_ITEMS_TOTAL
            .with_label_values(&[operation, status])
            .inc();
    }

    fn report(
        &self,
        operation: &str,
        results: Vec<BatchOperationResult>,
    ) -> BatchReport<BatchOperationResult> {
        for result in &results {
            self.count(operation, result.success);
        }
        let report = BatchReport::from_results(results);
        info!(
            operation,
            items = report.results.len(),
            failed = report.results.iter().filter(|r| !r.success).count(),
            "Batch processed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::ActivityEvent;
    use crate::models::{AnswerMap, AnswerValue, CompletionStatus};
    use crate::services::state_cache::InMemoryStateCache;
    use crate::services::state_store::{AttemptStore, InMemoryAttemptStore, VersionedStateStore};
    use crate::utils::retry::RetryConfig;
    use std::time::Duration;

    async fn executor(ids: &[&str]) -> (BatchExecutor, Arc<ConcurrencyController>, Arc<InMemoryAttemptStore>) {
        let store = Arc::new(InMemoryAttemptStore::new());
        for id in ids {
            store.insert_state(AttemptState::new(*id)).await.unwrap();
        }
        let controller = Arc::new(ConcurrencyController::new(
            VersionedStateStore::new(store.clone(), Duration::from_secs(1)),
            Arc::new(InMemoryStateCache::new()),
            RetryConfig::default(),
        ));
        let sessions = Arc::new(SessionManager::new(controller.clone(), Duration::from_secs(60)));
        (
            BatchExecutor::new(controller.clone(), sessions, 5),
            controller,
            store,
        )
    }

    fn save_op(id: &str, expected_version: i64) -> BatchSaveOp {
        let mut answers = AnswerMap::new();
        answers.insert("q1".into(), AnswerValue::from(id));
        BatchSaveOp {
            attempt_id: id.into(),
            answers,
            auto_save_data: AnswerMap::new(),
            expected_version,
        }
    }

    #[tokio::test]
    async fn stale_item_does_not_affect_its_neighbours() {
        let (executor, controller, _) = executor(&["a", "b", "c"]).await;
        controller
            .save("b", &StatePatch::answers(AnswerMap::new()), 1)
            .await
            .unwrap();

        let report = executor
            .batch_save(vec![save_op("a", 1), save_op("b", 1), save_op("c", 1)])
            .await
            .unwrap();

        let flags: Vec<bool> = report.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, true]);
        assert!(!report.success);
        assert_eq!(report.results[1].error_code.as_deref(), Some("version_mismatch"));
        assert_eq!(report.results[0].new_version, Some(2));
        assert_eq!(controller.read("c").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn oversized_or_empty_batches_are_rejected_whole() {
        let (executor, _, store) = executor(&["a"]).await;

        let err = executor.batch_save(vec![]).await.unwrap_err();
        assert_eq!(err.code(), "invalid_batch_data");

        let ops = (0..6).map(|_| save_op("a", 1)).collect();
        let err = executor.batch_save(ops).await.unwrap_err();
        assert_eq!(err.code(), "invalid_batch_data");
        assert_eq!(store.committed_writes(), 0);
    }

    #[tokio::test]
    async fn validate_multiple_is_read_only() {
        let (executor, controller, store) = executor(&["open", "done"]).await;
        controller
            .close_attempt("done", CompletionStatus::Submitted, 1)
            .await
            .unwrap();
        let writes_before = store.committed_writes();

        let results = executor
            .validate_multiple(vec!["open".into(), "done".into(), "ghost".into()])
            .await
            .unwrap();

        assert!(results[0].writable);
        assert_eq!(results[1].error_code.as_deref(), Some("attempt_closed"));
        assert!(!results[2].exists);
        assert_eq!(store.committed_writes(), writes_before);
        assert_eq!(controller.read("open").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn activity_for_unknown_attempt_fails_only_that_entry() {
        let (executor, _, store) = executor(&["a"]).await;
        let event = ActivityEvent {
            kind: "focus_lost".into(),
            payload: serde_json::json!({"tab": 2}),
            occurred_at: None,
        };

        let report = executor
            .batch_activity(
                vec![
                    BatchActivityEntry {
                        attempt_id: "a".into(),
                        events: vec![event.clone(), event.clone()],
                    },
                    BatchActivityEntry {
                        attempt_id: "ghost".into(),
                        events: vec![event],
                    },
                ],
                Some("proctor-1"),
            )
            .await
            .unwrap();

        assert_eq!(report.results[0].inserted_count, Some(2));
        assert_eq!(report.results[1].error_code.as_deref(), Some("attempt_not_found"));
        let records = store.activity_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].actor_id.as_deref(), Some("proctor-1"));
    }

    #[tokio::test]
    async fn transient_store_failures_do_not_fail_the_batch() {
        let (executor, _, store) = executor(&["a", "b"]).await;

        store.fail_next_calls(1);
        let lookups = executor
            .multiple_states(vec!["a".into(), "b".into()])
            .await
            .unwrap();
        assert!(lookups.iter().all(|l| l.state.is_some()));

        store.fail_next_calls(1);
        let report = executor
            .batch_activity(
                vec![BatchActivityEntry {
                    attempt_id: "a".into(),
                    events: vec![ActivityEvent {
                        kind: "paste".into(),
                        payload: serde_json::Value::Null,
                        occurred_at: None,
                    }],
                }],
                None,
            )
            .await
            .unwrap();
        assert!(report.results[0].success);
        assert_eq!(store.activity_records().len(), 1);
    }

    #[tokio::test]
    async fn multiple_info_summarises_without_answers() {
        let (executor, controller, _) = executor(&["a"]).await;
        let mut patch = StatePatch::default();
        patch.answers.insert("q1".into(), AnswerValue::from("x"));
        controller.save("a", &patch, 1).await.unwrap();

        let infos = executor
            .multiple_info(vec!["a".into(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(infos[0].version, Some(2));
        assert_eq!(infos[0].answered_count, 1);
        assert!(!infos[1].found);
    }
}
