use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StoreError;
use crate::metrics::track_store_operation;
use crate::models::activity::ActivityRecord;
use crate::models::{AttemptState, StatePatch};

/// Result of a conditional write. Only `Committed` mutated anything.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed(AttemptState),
    VersionMismatch(AttemptState),
    Closed(AttemptState),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ConditionalWrite {
    pub attempt_id: String,
    pub expected_version: i64,
    pub patch: StatePatch,
}

/// Durable home of attempt state.
///
/// `conditional_update` is the only mutation of existing attempts and must
/// compare `expected_version` and apply the patch as one atomic step,
/// incrementing the version by exactly one.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn read_state(&self, attempt_id: &str) -> Result<Option<AttemptState>, StoreError>;

    async fn conditional_update(
        &self,
        attempt_id: &str,
        expected_version: i64,
        patch: &StatePatch,
    ) -> Result<WriteOutcome, StoreError>;

    async fn batch_read(
        &self,
        attempt_ids: &[String],
    ) -> Result<HashMap<String, AttemptState>, StoreError>;

    /// Independent conditional writes; one item's failure never affects another.
    async fn batch_write(
        &self,
        writes: &[ConditionalWrite],
    ) -> Vec<Result<WriteOutcome, StoreError>> {
        futures::future::join_all(writes.iter().map(|write| {
            self.conditional_update(&write.attempt_id, write.expected_version, &write.patch)
        }))
        .await
    }

    /// Used by the attempt-creation flow, which lives outside this service.
    async fn insert_state(&self, state: AttemptState) -> Result<(), StoreError>;

    async fn append_activity(&self, records: Vec<ActivityRecord>) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Store handle shared by the engine: applies the per-operation deadline and
/// records metrics around every call.
#[derive(Clone)]
pub struct VersionedStateStore {
    inner: Arc<dyn AttemptStore>,
    timeout: Duration,
}

impl VersionedStateStore {
    pub fn new(inner: Arc<dyn AttemptStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, future: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.timeout;
        track_store_operation(operation, async move {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    operation,
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        })
        .await
    }

    pub async fn read_state(&self, attempt_id: &str) -> Result<Option<AttemptState>, StoreError> {
        self.with_deadline("read_state", self.inner.read_state(attempt_id))
            .await
    }

    pub async fn conditional_update(
        &self,
        attempt_id: &str,
        expected_version: i64,
        patch: &StatePatch,
    ) -> Result<WriteOutcome, StoreError> {
        self.with_deadline(
            "conditional_update",
            self.inner
                .conditional_update(attempt_id, expected_version, patch),
        )
        .await
    }

    pub async fn batch_read(
        &self,
        attempt_ids: &[String],
    ) -> Result<HashMap<String, AttemptState>, StoreError> {
        self.with_deadline("batch_read", self.inner.batch_read(attempt_ids))
            .await
    }

    /// The deadline covers the whole batch; on expiry every item is reported
    /// as an unknown outcome.
    pub async fn batch_write(
        &self,
        writes: &[ConditionalWrite],
    ) -> Vec<Result<WriteOutcome, StoreError>> {
        let result = self
            .with_deadline("batch_write", async {
                Ok(self.inner.batch_write(writes).await)
            })
            .await;
        match result {
            Ok(outcomes) => outcomes,
            Err(err) => writes.iter().map(|_| Err(err.clone())).collect(),
        }
    }

    pub async fn insert_state(&self, state: AttemptState) -> Result<(), StoreError> {
        self.with_deadline("insert_state", self.inner.insert_state(state))
            .await
    }

    pub async fn append_activity(&self, records: Vec<ActivityRecord>) -> Result<usize, StoreError> {
        self.with_deadline("append_activity", self.inner.append_activity(records))
            .await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.with_deadline("ping", self.inner.ping()).await
    }
}

/// Mutex-guarded store for tests and local runs.
#[derive(Default)]
pub struct InMemoryAttemptStore {
    states: Mutex<HashMap<String, AttemptState>>,
    activity: Mutex<Vec<ActivityRecord>>,
    committed_writes: AtomicU64,
    fail_next: AtomicU32,
    delay_after_write_ms: AtomicU64,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> Result<MutexGuard<'_, HashMap<String, AttemptState>>, StoreError> {
        self.states
            .lock()
            .map_err(|_| StoreError::Backend("state map poisoned".to_string()))
    }

    /// Fails the next `count` calls with `StoreError::Unavailable`.
    pub fn fail_next_calls(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Sleeps after each committed write, simulating a slow acknowledgement.
    pub fn set_delay_after_write(&self, delay: Duration) {
        self.delay_after_write_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn committed_writes(&self) -> u64 {
        self.committed_writes.load(Ordering::SeqCst)
    }

    pub fn activity_records(&self) -> Vec<ActivityRecord> {
        self.activity
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let took = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn read_state(&self, attempt_id: &str) -> Result<Option<AttemptState>, StoreError> {
        self.injected_failure()?;
        Ok(self.states()?.get(attempt_id).cloned())
    }

    async fn conditional_update(
        &self,
        attempt_id: &str,
        expected_version: i64,
        patch: &StatePatch,
    ) -> Result<WriteOutcome, StoreError> {
        self.injected_failure()?;
        let outcome = {
            let mut states = self.states()?;
            match states.get_mut(attempt_id) {
                None => WriteOutcome::NotFound,
                Some(state) if state.is_closed() => WriteOutcome::Closed(state.clone()),
                Some(state) if state.version != expected_version => {
                    WriteOutcome::VersionMismatch(state.clone())
                }
                Some(state) => {
                    state.apply(patch, Utc::now());
                    self.committed_writes.fetch_add(1, Ordering::SeqCst);
                    WriteOutcome::Committed(state.clone())
                }
            }
        };

        let delay = self.delay_after_write_ms.load(Ordering::SeqCst);
        if delay > 0 && matches!(outcome, WriteOutcome::Committed(_)) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(outcome)
    }

    async fn batch_read(
        &self,
        attempt_ids: &[String],
    ) -> Result<HashMap<String, AttemptState>, StoreError> {
        self.injected_failure()?;
        let states = self.states()?;
        Ok(attempt_ids
            .iter()
            .filter_map(|id| states.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    async fn insert_state(&self, state: AttemptState) -> Result<(), StoreError> {
        let mut states = self.states()?;
        if states.contains_key(&state.attempt_id) {
            return Err(StoreError::Backend(format!(
                "attempt {} already exists",
                state.attempt_id
            )));
        }
        states.insert(state.attempt_id.clone(), state);
        Ok(())
    }

    async fn append_activity(&self, records: Vec<ActivityRecord>) -> Result<usize, StoreError> {
        self.injected_failure()?;
        let count = records.len();
        self.activity
            .lock()
            .map_err(|_| StoreError::Backend("activity log poisoned".to_string()))?
            .extend(records);
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
