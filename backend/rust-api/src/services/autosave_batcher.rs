use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::concurrency::ConcurrencyController;
use super::conflict_resolver::resolve_recorded;
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{AUTOSAVE_COALESCED_CHANGES_TOTAL, AUTOSAVE_FLUSHES_TOTAL};
use crate::models::attempt::validate_field_key;
use crate::models::sync::{AutoSaveOutcome, AutoSaveOverrides, ResolvedConflict};
use crate::models::{AnswerMap, ChangeEvent, ConflictStrategy, StatePatch};

#[derive(Debug, Clone)]
pub struct AutoSaveConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub batch_size: usize,
    pub conflict_strategy: ConflictStrategy,
}

impl AutoSaveConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.autosave_interval_ms),
            max_retries: settings.autosave_max_retries,
            batch_size: settings.autosave_batch_size.max(1),
            conflict_strategy: settings.conflict_strategy,
        }
    }

    pub fn with_overrides(&self, overrides: &AutoSaveOverrides) -> Self {
        Self {
            interval: overrides
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(self.interval),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            batch_size: overrides.batch_size.unwrap_or(self.batch_size).max(1),
            conflict_strategy: overrides
                .conflict_strategy
                .unwrap_or(self.conflict_strategy),
        }
    }
}

type Waiter = oneshot::Sender<SyncResult<AutoSaveOutcome>>;

/// Held for the whole of a commit. Carries the result of the last commit so a
/// flush that waited on it can report it.
type CommitSlot = Arc<AsyncMutex<Option<SyncResult<AutoSaveOutcome>>>>;

struct PendingBatch {
    generation: u64,
    changes: Vec<ChangeEvent>,
    expected_version: Option<i64>,
    config: AutoSaveConfig,
    waiters: Vec<Waiter>,
}

impl PendingBatch {
    fn distinct_questions(&self) -> usize {
        let mut seen: Vec<&str> = self.changes.iter().map(|c| c.question_id.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}

/// Handle to the outcome of the batch an enqueue joined.
pub struct ScheduledSave {
    receiver: oneshot::Receiver<SyncResult<AutoSaveOutcome>>,
}

impl ScheduledSave {
    pub async fn outcome(self) -> SyncResult<AutoSaveOutcome> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(SyncError::Internal("auto-save batch was dropped".into())))
    }
}

/// Last write per question wins, by arrival order. Client timestamps are
/// ignored since client clocks are not trusted.
pub fn coalesce(changes: &[ChangeEvent]) -> AnswerMap {
    let mut latest = AnswerMap::new();
    for change in changes {
        latest.insert(change.question_id.clone(), change.value.clone());
    }
    latest
}

/// Coalesces field-level edits per attempt over a time window and commits each
/// window as one conditional write.
pub struct AutoSaveBatcher {
    controller: Arc<ConcurrencyController>,
    defaults: AutoSaveConfig,
    pending: Mutex<HashMap<String, PendingBatch>>,
    committing: Mutex<HashMap<String, CommitSlot>>,
    next_generation: AtomicU64,
}

impl AutoSaveBatcher {
    pub fn new(controller: Arc<ConcurrencyController>, defaults: AutoSaveConfig) -> Self {
        Self {
            controller,
            defaults,
            pending: Mutex::new(HashMap::new()),
            committing: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn pending_batches(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Adds changes to the attempt's open batch, opening one (and its flush
    /// timer) if needed. `expected_version` is the client's last-known version;
    /// without one the batch commits against a fresh read.
    pub fn enqueue(
        self: &Arc<Self>,
        attempt_id: &str,
        changes: Vec<ChangeEvent>,
        expected_version: Option<i64>,
        overrides: Option<&AutoSaveOverrides>,
    ) -> SyncResult<ScheduledSave> {
        if changes.is_empty() {
            return Err(SyncError::InvalidRequest("no changes to save".into()));
        }
        for change in &changes {
            validate_field_key(&change.question_id).map_err(SyncError::InvalidRequest)?;
            change
                .value
                .validate()
                .map_err(|e| SyncError::InvalidRequest(format!("{}: {}", change.question_id, e)))?;
        }

        let config = match overrides {
            Some(overrides) => self.defaults.with_overrides(overrides),
            None => self.defaults.clone(),
        };

        let (sender, receiver) = oneshot::channel();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| SyncError::Internal("auto-save queue poisoned".into()))?;

        let mut timer = None;
        let batch = pending.entry(attempt_id.to_string()).or_insert_with(|| {
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            timer = Some(config.interval);
            PendingBatch {
                generation,
                changes: Vec::new(),
                expected_version,
                config: config.clone(),
                waiters: Vec::new(),
            }
        });

        batch.changes.extend(changes);
        batch.waiters.push(sender);
        if overrides.is_some() {
            if timer.is_none() && batch.config.interval != config.interval {
                // A new generation orphans the timer armed with the old interval.
                batch.generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                timer = Some(config.interval);
            }
            batch.config = config;
        }
        if batch.expected_version.is_none() {
            batch.expected_version = expected_version;
        }

        let flush_now = batch.distinct_questions() >= batch.config.batch_size;
        let generation = batch.generation;
        debug!(
            attempt_id,
            queued = batch.changes.len(),
            flush_now,
            "auto-save changes queued"
        );
        drop(pending);

        if flush_now {
            self.spawn_flush(attempt_id.to_string(), generation, Duration::ZERO);
        } else if let Some(interval) = timer {
            self.spawn_flush(attempt_id.to_string(), generation, interval);
        }

        Ok(ScheduledSave { receiver })
    }

    /// Commits the attempt's open batch right away, if there is one. A commit
    /// already in flight for the attempt is waited for, and its result is
    /// returned when there was nothing left to commit.
    pub async fn flush(&self, attempt_id: &str) -> Option<SyncResult<AutoSaveOutcome>> {
        let slot = self.commit_slot(attempt_id);
        let result = {
            let mut last = slot.lock().await;
            match self.take(attempt_id, None) {
                Some(batch) => Some(self.commit(attempt_id, batch).await),
                None => last.take(),
            }
        };
        self.release_commit_slot(attempt_id, slot);
        result
    }

    /// Commits every open batch. Used on shutdown so queued edits are not lost.
    pub async fn flush_all(&self) -> usize {
        let attempt_ids: Vec<String> = match self.pending.lock() {
            Ok(pending) => pending.keys().cloned().collect(),
            Err(_) => return 0,
        };

        let mut flushed = 0;
        for attempt_id in attempt_ids {
            if let Some(result) = self.flush(&attempt_id).await {
                if let Err(err) = result {
                    warn!(attempt_id = %attempt_id, "Auto-save flush on shutdown failed: {}", err);
                }
                flushed += 1;
            }
        }
        flushed
    }

    fn spawn_flush(self: &Arc<Self>, attempt_id: String, generation: u64, delay: Duration) {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let slot = batcher.commit_slot(&attempt_id);
            {
                let mut last = slot.lock().await;
                if let Some(batch) = batcher.take(&attempt_id, Some(generation)) {
                    *last = Some(batcher.commit(&attempt_id, batch).await);
                }
            }
            batcher.release_commit_slot(&attempt_id, slot);
        });
    }

    fn commit_slot(&self, attempt_id: &str) -> CommitSlot {
        match self.committing.lock() {
            Ok(mut committing) => committing.entry(attempt_id.to_string()).or_default().clone(),
            Err(_) => CommitSlot::default(),
        }
    }

    /// Drops the slot once nobody holds or waits on it.
    fn release_commit_slot(&self, attempt_id: &str, slot: CommitSlot) {
        let Ok(mut committing) = self.committing.lock() else {
            return;
        };
        drop(slot);
        if committing
            .get(attempt_id)
            .is_some_and(|shared| Arc::strong_count(shared) == 1)
        {
            committing.remove(attempt_id);
        }
    }

    fn take(&self, attempt_id: &str, generation: Option<u64>) -> Option<PendingBatch> {
        let mut pending = self.pending.lock().ok()?;
        match (pending.get(attempt_id), generation) {
            (Some(batch), Some(g)) if batch.generation != g => None,
            (Some(_), _) => pending.remove(attempt_id),
            (None, _) => None,
        }
    }

    async fn commit(&self, attempt_id: &str, batch: PendingBatch) -> SyncResult<AutoSaveOutcome> {
        let PendingBatch {
            changes,
            expected_version,
            config,
            waiters,
            ..
        } = batch;

        let result = self
            .commit_changes(attempt_id, &changes, expected_version, &config)
            .await;

        let status = match &result {
            Ok(_) => "success",
            Err(SyncError::VersionMismatch { .. }) => "conflict",
            Err(_) => "error",
        };
        AUTOSAVE_FLUSHES_TOTAL.with_label_values(&[status]).inc();

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn commit_changes(
        &self,
        attempt_id: &str,
        changes: &[ChangeEvent],
        expected_version: Option<i64>,
        config: &AutoSaveConfig,
    ) -> SyncResult<AutoSaveOutcome> {
        let local = coalesce(changes);
        AUTOSAVE_COALESCED_CHANGES_TOTAL.inc_by((changes.len() - local.len()) as u64);

        let mut expected = match expected_version {
            Some(version) => version,
            None => self.controller.read(attempt_id).await?.version,
        };
        let mut answers = local.clone();
        let mut decisions: BTreeMap<String, ResolvedConflict> = BTreeMap::new();
        let mut retries_left = config.max_retries;

        loop {
            if answers.is_empty() {
                // Every field already holds the value the strategy picked.
                return Ok(self.outcome(expected, decisions, changes.len()));
            }

            match self
                .controller
                .save(attempt_id, &StatePatch::answers(answers.clone()), expected)
                .await
            {
                Ok(receipt) => {
                    info!(
                        attempt_id,
                        version = receipt.new_version,
                        fields = answers.len(),
                        "Auto-save batch committed"
                    );
                    return Ok(self.outcome(receipt.new_version, decisions, changes.len()));
                }
                Err(SyncError::VersionMismatch { latest }) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        attempt_id,
                        expected,
                        server_version = latest.version,
                        strategy = config.conflict_strategy.as_str(),
                        "Auto-save conflict, resolving"
                    );

                    answers.clear();
                    for (question_id, local_value) in &local {
                        let server_value = latest.answers.get(question_id);
                        if server_value == Some(local_value) {
                            continue;
                        }
                        // Fields the server never saw are not in conflict.
                        let Some(server_value) = server_value else {
                            answers.insert(question_id.clone(), local_value.clone());
                            continue;
                        };
                        let server_value = Some(server_value);
                        let decision = resolve_recorded(
                            question_id,
                            Some(local_value),
                            server_value,
                            config.conflict_strategy,
                        );
                        if let Some(value) = &decision.resolved_value {
                            if server_value != Some(value) {
                                answers.insert(question_id.clone(), value.clone());
                            }
                        }
                        decisions.insert(question_id.clone(), decision);
                    }
                    expected = latest.version;
                }
                Err(err) => {
                    if let SyncError::VersionMismatch { latest } = &err {
                        warn!(
                            attempt_id,
                            server_version = latest.version,
                            "Auto-save retry budget exhausted, surfacing conflict"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    fn outcome(
        &self,
        version: i64,
        decisions: BTreeMap<String, ResolvedConflict>,
        coalesced_changes: usize,
    ) -> AutoSaveOutcome {
        AutoSaveOutcome {
            success: true,
            version,
            conflicts: decisions.into_values().collect(),
            coalesced_changes,
        }
    }
}
