use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::autosave_batcher::coalesce;
use super::concurrency::ConcurrencyController;
use crate::error::{SyncError, SyncResult};
use crate::metrics::{SYNC_SESSIONS_ACTIVE, SYNC_SESSIONS_EVICTED_TOTAL};
use crate::models::sync::{MonitoringSnapshot, SessionView, SyncStatusReport, SyncStats};
use crate::models::{AttemptState, ChangeEvent, SessionState, StatePatch, SyncOutcome, SyncSession};

/// Tracks live client connections per attempt and reconciles their buffered
/// changes against the authoritative state.
///
/// Sessions are bookkeeping only. Dropping or evicting one never touches the
/// attempt it points at.
pub struct SessionManager {
    controller: Arc<ConcurrencyController>,
    sessions: RwLock<HashMap<String, SyncSession>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(controller: Arc<ConcurrencyController>, ttl: Duration) -> Self {
        Self {
            controller,
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn initialize(
        &self,
        attempt_id: &str,
        connection_id: &str,
    ) -> SyncResult<MonitoringSnapshot> {
        if connection_id.is_empty() {
            return Err(SyncError::InvalidRequest("connection_id is required".into()));
        }

        let now = Utc::now();
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                connection_id.to_string(),
                SyncSession {
                    connection_id: connection_id.to_string(),
                    attempt_id: attempt_id.to_string(),
                    last_known_version: 0,
                    last_sync_at: now,
                    state: SessionState::Connecting,
                },
            );
            SYNC_SESSIONS_ACTIVE.set(sessions.len() as i64);
        }

        let state = match self.controller.read(attempt_id).await {
            Ok(state) => state,
            Err(err) => {
                self.remove(connection_id).await;
                return Err(err);
            }
        };

        let session = self
            .mark(attempt_id, connection_id, SessionState::Synced, state.version)
            .await
            .ok_or_else(|| SyncError::Internal("session vanished during init".into()))?;

        info!(
            attempt_id,
            connection_id,
            version = state.version,
            "Monitoring session initialized"
        );
        Ok(MonitoringSnapshot { session, state })
    }

    /// Commits buffered changes if the client is current, otherwise hands the
    /// server state back together with the changes it could not apply.
    pub async fn synchronize(
        &self,
        attempt_id: &str,
        connection_id: Option<&str>,
        local_version: i64,
        changes: Vec<ChangeEvent>,
    ) -> SyncResult<SyncOutcome> {
        if changes.is_empty() {
            let state = self.controller.read(attempt_id).await?;
            self.settle_session(
                attempt_id,
                connection_id,
                SessionState::Synced,
                state.version,
            )
            .await;
            return Ok(if state.version == local_version {
                SyncOutcome::Synced {
                    version: state.version,
                    applied_changes: 0,
                }
            } else {
                SyncOutcome::Refreshed { state }
            });
        }

        let answers = coalesce(&changes);
        let applied_changes = answers.len();
        match self
            .controller
            .save(attempt_id, &StatePatch::answers(answers), local_version)
            .await
        {
            Ok(receipt) => {
                self.settle_session(
                    attempt_id,
                    connection_id,
                    SessionState::Synced,
                    receipt.new_version,
                )
                .await;
                Ok(SyncOutcome::Synced {
                    version: receipt.new_version,
                    applied_changes,
                })
            }
            Err(SyncError::VersionMismatch { latest }) => {
                warn!(
                    attempt_id,
                    local_version,
                    server_version = latest.version,
                    pending = changes.len(),
                    "Client is behind, returning changes for resolution"
                );
                self.settle_session(
                    attempt_id,
                    connection_id,
                    SessionState::Conflict,
                    local_version,
                )
                .await;
                Ok(SyncOutcome::Conflict {
                    server_state: *latest,
                    unresolved_changes: changes,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Re-fetches the authoritative state and drops whatever the attempt's
    /// sessions assumed. Safe to repeat.
    pub async fn force_synchronization(&self, attempt_id: &str) -> SyncResult<AttemptState> {
        let state = self.controller.read(attempt_id).await?;
        let now = Utc::now();

        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut().filter(|s| s.attempt_id == attempt_id) {
            session.state = SessionState::Synced;
            session.last_known_version = state.version;
            session.last_sync_at = now;
        }
        debug!(attempt_id, version = state.version, "Forced resynchronization");
        Ok(state)
    }

    pub async fn sync_status(&self, attempt_id: &str) -> SyncResult<SyncStatusReport> {
        let state = self.controller.read(attempt_id).await?;
        let sessions = self.sessions.read().await;

        let mut views: Vec<SessionView> = sessions
            .values()
            .filter(|s| s.attempt_id == attempt_id)
            .map(|s| SessionView {
                connection_id: s.connection_id.clone(),
                state: s.state,
                last_known_version: s.last_known_version,
                last_sync_at: s.last_sync_at,
                in_sync: s.last_known_version == state.version,
            })
            .collect();
        views.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        Ok(SyncStatusReport {
            attempt_id: attempt_id.to_string(),
            server_version: state.version,
            completion_status: state.completion_status,
            sessions: views,
        })
    }

    pub async fn stats(&self, pending_autosave_batches: usize) -> SyncStats {
        let sessions = self.sessions.read().await;
        let mut stats = SyncStats {
            sessions_total: sessions.len(),
            pending_autosave_batches,
            ..Default::default()
        };

        let mut attempts: Vec<&str> = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            match session.state {
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Synced => stats.synced += 1,
                SessionState::Conflict => stats.conflict += 1,
                SessionState::Disconnected => {}
            }
            attempts.push(&session.attempt_id);
        }
        attempts.sort_unstable();
        attempts.dedup();
        stats.monitored_attempts = attempts.len();
        stats
    }

    /// Refreshes `last_sync_at`. Returns false for unknown connections.
    pub async fn heartbeat(&self, connection_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(connection_id) {
            Some(session) => {
                session.last_sync_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Records a version the connection has observed through a commit of its own.
    pub async fn acknowledge(&self, attempt_id: &str, connection_id: &str, version: i64) {
        self.mark(attempt_id, connection_id, SessionState::Synced, version)
            .await;
    }

    pub async fn disconnect(&self, connection_id: &str) -> Option<SyncSession> {
        let mut session = self.remove(connection_id).await?;
        session.state = SessionState::Disconnected;
        info!(
            attempt_id = %session.attempt_id,
            connection_id,
            "Monitoring session disconnected"
        );
        Some(session)
    }

    pub async fn live_session_counts(&self) -> HashMap<String, usize> {
        let sessions = self.sessions.read().await;
        let mut counts = HashMap::new();
        for session in sessions.values() {
            *counts.entry(session.attempt_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Drops sessions idle longer than the TTL.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| now - s.last_sync_at <= ttl);
        let evicted = before - sessions.len();

        SYNC_SESSIONS_ACTIVE.set(sessions.len() as i64);
        if evicted > 0 {
            SYNC_SESSIONS_EVICTED_TOTAL.inc_by(evicted as u64);
            info!(evicted, remaining = sessions.len(), "Evicted idle sync sessions");
        }
        evicted
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        info!(
            "Starting sync session sweeper (interval {}s, ttl {}s)",
            interval.as_secs(),
            self.ttl.as_secs()
        );
        loop {
            sleep(interval).await;
            self.evict_expired(Utc::now()).await;
        }
    }

    async fn settle_session(
        &self,
        attempt_id: &str,
        connection_id: Option<&str>,
        state: SessionState,
        version: i64,
    ) {
        if let Some(connection_id) = connection_id {
            self.mark(attempt_id, connection_id, state, version).await;
        }
    }

    /// Updates the connection's session only while it still monitors
    /// `attempt_id`; a version of another attempt means nothing to it.
    async fn mark(
        &self,
        attempt_id: &str,
        connection_id: &str,
        state: SessionState,
        version: i64,
    ) -> Option<SyncSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(connection_id)?;
        if session.attempt_id != attempt_id {
            debug!(
                attempt_id,
                connection_id,
                monitored = %session.attempt_id,
                "Ignoring sync for an attempt the session does not monitor"
            );
            return None;
        }
        session.state = state;
        session.last_known_version = version;
        session.last_sync_at = Utc::now();
        Some(session.clone())
    }

    async fn remove(&self, connection_id: &str) -> Option<SyncSession> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(connection_id);
        SYNC_SESSIONS_ACTIVE.set(sessions.len() as i64);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::state_cache::InMemoryStateCache;
    use crate::services::state_store::{AttemptStore, InMemoryAttemptStore, VersionedStateStore};
    use crate::utils::retry::RetryConfig;

    async fn manager(ttl: Duration) -> (SessionManager, Arc<ConcurrencyController>) {
        let store = Arc::new(InMemoryAttemptStore::new());
        store.insert_state(AttemptState::new("a")).await.unwrap();
        let controller = Arc::new(ConcurrencyController::new(
            VersionedStateStore::new(store, Duration::from_secs(1)),
            Arc::new(InMemoryStateCache::new()),
            RetryConfig::default(),
        ));
        (SessionManager::new(controller.clone(), ttl), controller)
    }

    fn bump(version: i64) -> StatePatch {
        let mut patch = StatePatch::default();
        patch
            .answers
            .insert("q0".into(), format!("v{}", version).into());
        patch
    }

    #[tokio::test]
    async fn initialize_delivers_snapshot_and_marks_synced() {
        let (sessions, _) = manager(Duration::from_secs(60)).await;
        let snapshot = sessions.initialize("a", "c1").await.unwrap();
        assert_eq!(snapshot.session.state, SessionState::Synced);
        assert_eq!(snapshot.session.last_known_version, 1);
        assert_eq!(snapshot.state.version, 1);
    }

    #[tokio::test]
    async fn initialize_for_unknown_attempt_leaves_no_session() {
        let (sessions, _) = manager(Duration::from_secs(60)).await;
        let err = sessions.initialize("missing", "c1").await.unwrap_err();
        assert_eq!(err.code(), "attempt_not_found");
        assert_eq!(sessions.stats(0).await.sessions_total, 0);
    }

    #[tokio::test]
    async fn current_client_takes_fast_path() {
        let (sessions, _) = manager(Duration::from_secs(60)).await;
        sessions.initialize("a", "c1").await.unwrap();

        let outcome = sessions
            .synchronize("a", Some("c1"), 1, vec![ChangeEvent::new("q1", "x")])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                version: 2,
                applied_changes: 1
            }
        );
        let report = sessions.sync_status("a").await.unwrap();
        assert!(report.sessions[0].in_sync);
    }

    #[tokio::test]
    async fn stale_client_gets_conflict_with_unresolved_changes() {
        let (sessions, controller) = manager(Duration::from_secs(60)).await;
        sessions.initialize("a", "c1").await.unwrap();
        controller.save("a", &bump(1), 1).await.unwrap();

        let changes = vec![ChangeEvent::new("q1", "offline edit")];
        let outcome = sessions
            .synchronize("a", Some("c1"), 1, changes.clone())
            .await
            .unwrap();
        match outcome {
            SyncOutcome::Conflict {
                server_state,
                unresolved_changes,
            } => {
                assert_eq!(server_state.version, 2);
                assert_eq!(unresolved_changes, changes);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let stats = sessions.stats(0).await;
        assert_eq!(stats.conflict, 1);
        assert_eq!(controller.read("a").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn force_sync_is_idempotent_and_clears_conflict() {
        let (sessions, controller) = manager(Duration::from_secs(60)).await;
        sessions.initialize("a", "c1").await.unwrap();
        controller.save("a", &bump(1), 1).await.unwrap();
        sessions
            .synchronize("a", Some("c1"), 1, vec![ChangeEvent::new("q1", "x")])
            .await
            .unwrap();

        let first = sessions.force_synchronization("a").await.unwrap();
        let second = sessions.force_synchronization("a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sessions.stats(0).await.synced, 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_without_touching_state() {
        let (sessions, controller) = manager(Duration::from_secs(300)).await;
        sessions.initialize("a", "old").await.unwrap();
        sessions.initialize("a", "fresh").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(sessions.evict_expired(later).await, 2);

        sessions.initialize("a", "fresh").await.unwrap();
        assert_eq!(sessions.evict_expired(Utc::now()).await, 0);
        assert_eq!(sessions.live_session_counts().await.get("a"), Some(&1));
        assert_eq!(controller.read("a").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn activity_on_other_attempt_leaves_session_alone() {
        let (sessions, controller) = manager(Duration::from_secs(60)).await;
        controller
            .store()
            .insert_state(AttemptState::new("b"))
            .await
            .unwrap();
        sessions.initialize("a", "c1").await.unwrap();
        controller.save("b", &bump(1), 1).await.unwrap();

        sessions
            .synchronize("b", Some("c1"), 1, vec![ChangeEvent::new("q1", "x")])
            .await
            .unwrap();
        sessions.acknowledge("b", "c1", 7).await;

        let report = sessions.sync_status("a").await.unwrap();
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].state, SessionState::Synced);
        assert_eq!(report.sessions[0].last_known_version, 1);
        assert!(report.sessions[0].in_sync);
        assert!(sessions.sync_status("b").await.unwrap().sessions.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_terminal() {
        let (sessions, _) = manager(Duration::from_secs(60)).await;
        sessions.initialize("a", "c1").await.unwrap();

        let session = sessions.disconnect("c1").await.unwrap();
        assert_eq!(session.state, SessionState::Disconnected);
        assert!(!sessions.heartbeat("c1").await);
        assert!(sessions.disconnect("c1").await.is_none());
    }
}
