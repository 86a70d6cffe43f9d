//! Stage Lock
//!
//! Advisory per-(session, stage) lock stored inside the session metadata under
//! `"<stage>_lock"`. Acquisition never blocks: it is a versioned metadata
//! write followed by a re-read that must show this writer's `started_at` and
//! holder token. A lock whose `started_at` is older than the TTL is
//! abandoned and may be reclaimed the same way; the store's compare-and-swap
//! lets exactly one reclaimer through. A live holder keeps its lock by
//! refreshing `started_at` before every billed attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::storage::SharedStore;
use crate::types::{IntakeError, MetadataWrite, Result, Session, Stage};

/// Times a lock write is retried after losing a metadata race to an unrelated write
const WRITE_RETRIES: usize = 5;

/// Lock fields as stored in session metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockState {
    pub busy: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub holder: Option<String>,
    pub attempts: u32,
}

impl LockState {
    pub fn read(session: &Session, stage: Stage) -> Self {
        session
            .metadata
            .get(&stage.lock_key())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn held(holder: &str, started_at: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            busy: true,
            started_at: Some(started_at),
            holder: Some(holder.to_string()),
            attempts,
        }
    }

    fn patch(&self, stage: Stage) -> Result<Map<String, Value>> {
        let mut patch = Map::new();
        patch.insert(stage.lock_key(), serde_json::to_value(self)?);
        Ok(patch)
    }

    /// Busy and younger than `ttl`
    pub fn is_held(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.busy && !self.is_abandoned(ttl, now)
    }

    /// Busy but older than `ttl` (or missing its start time)
    pub fn is_abandoned(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !self.busy {
            return false;
        }
        match self.started_at {
            Some(started_at) => now
                .signed_duration_since(started_at)
                .to_std()
                .is_ok_and(|age| age >= ttl),
            None => true,
        }
    }
}

/// Proof of lock ownership, handed back to [`StageLock::release`]
#[derive(Debug)]
#[must_use = "a held stage lock must be released"]
pub struct LockGuard {
    pub session_id: String,
    pub stage: Stage,
    pub holder: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockGuard),
    /// Another caller holds a live lock
    HeldByOther { started_at: DateTime<Utc> },
    /// The previous holder's lock had expired and now belongs to this caller
    Reclaimed {
        guard: LockGuard,
        previous_started_at: Option<DateTime<Utc>>,
    },
}

impl LockOutcome {
    pub fn into_guard(self) -> Option<LockGuard> {
        match self {
            Self::Acquired(guard) | Self::Reclaimed { guard, .. } => Some(guard),
            Self::HeldByOther { .. } => None,
        }
    }
}

/// How the guarded work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Succeeded,
    Failed,
}

#[derive(Clone)]
pub struct StageLock {
    store: SharedStore,
    ttl: Duration,
}

impl StageLock {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn load(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| IntakeError::NotFound(format!("Session {}", session_id)))
    }

    /// Try to take the lock for `(session_id, stage)`. Never waits.
    ///
    /// A lost compare-and-swap is retried while the lock still reads free,
    /// so unrelated metadata writes never turn a free lock into `HeldByOther`.
    pub fn try_acquire(&self, session_id: &str, stage: Stage) -> Result<LockOutcome> {
        for _ in 0..WRITE_RETRIES {
            let session = self.load(session_id)?;
            let current = LockState::read(&session, stage);
            let now = Utc::now();

            if current.is_held(self.ttl, now) {
                return Ok(LockOutcome::HeldByOther {
                    started_at: current.started_at.unwrap_or(now),
                });
            }
            let reclaiming = current.is_abandoned(self.ttl, now);

            let holder = uuid::Uuid::new_v4().to_string();
            let desired = LockState::held(&holder, now, current.attempts);

            let write = self.store.update_session_metadata(
                session_id,
                &desired.patch(stage)?,
                session.version,
            )?;
            if let MetadataWrite::Conflict = write {
                debug!(session_id, stage = stage.as_str(), "Session metadata moved, re-reading lock");
                continue;
            }

            // Re-read: ownership holds only if our started_at and token are there
            let observed = LockState::read(&self.load(session_id)?, stage);
            if observed.started_at != desired.started_at || observed.holder != desired.holder {
                debug!(session_id, stage = stage.as_str(), "Lost stage lock race");
                return Ok(LockOutcome::HeldByOther {
                    started_at: observed.started_at.unwrap_or(now),
                });
            }

            let guard = LockGuard {
                session_id: session_id.to_string(),
                stage,
                holder,
                started_at: now,
            };

            return if reclaiming {
                warn!(
                    session_id,
                    stage = stage.as_str(),
                    previous_started_at = ?current.started_at,
                    "Reclaimed abandoned stage lock"
                );
                Ok(LockOutcome::Reclaimed {
                    guard,
                    previous_started_at: current.started_at,
                })
            } else {
                debug!(session_id, stage = stage.as_str(), "Acquired stage lock");
                Ok(LockOutcome::Acquired(guard))
            };
        }

        // Metadata kept moving; whoever moved it last may hold the lock now
        let observed = LockState::read(&self.load(session_id)?, stage);
        Ok(LockOutcome::HeldByOther {
            started_at: observed.started_at.unwrap_or_else(Utc::now),
        })
    }

    /// Push the lock's `started_at` to now if `holder` still owns it.
    ///
    /// Returns `false` when the lock changed hands (or was released).
    pub fn refresh(&self, session_id: &str, stage: Stage, holder: &str) -> Result<bool> {
        for _ in 0..WRITE_RETRIES {
            let session = self.load(session_id)?;
            let current = LockState::read(&session, stage);
            if !current.busy || current.holder.as_deref() != Some(holder) {
                return Ok(false);
            }

            let refreshed = LockState::held(holder, Utc::now(), current.attempts);
            if let MetadataWrite::Applied { .. } = self.store.update_session_metadata(
                session_id,
                &refreshed.patch(stage)?,
                session.version,
            )? {
                debug!(session_id, stage = stage.as_str(), "Refreshed stage lock");
                return Ok(true);
            }
        }

        Err(IntakeError::Storage(format!(
            "Could not refresh {} lock for session {}: metadata kept changing",
            stage.as_str(),
            session_id
        )))
    }

    /// Whether a live (non-expired) lock is held for `(session_id, stage)`
    pub fn is_held(&self, session_id: &str, stage: Stage) -> Result<bool> {
        let session = self.load(session_id)?;
        Ok(LockState::read(&session, stage).is_held(self.ttl, Utc::now()))
    }

    /// Zero the lock's attempt counter unless someone holds it live.
    ///
    /// Returns `false` when a live holder prevented the reset.
    pub fn reset(&self, session_id: &str, stage: Stage) -> Result<bool> {
        for _ in 0..WRITE_RETRIES {
            let session = self.load(session_id)?;
            if LockState::read(&session, stage).is_held(self.ttl, Utc::now()) {
                return Ok(false);
            }

            let cleared = LockState::default().patch(stage)?;
            if let MetadataWrite::Applied { .. } =
                self.store
                    .update_session_metadata(session_id, &cleared, session.version)?
            {
                return Ok(true);
            }
        }

        Err(IntakeError::Storage(format!(
            "Could not reset {} lock for session {}: metadata kept changing",
            stage.as_str(),
            session_id
        )))
    }

    /// Clear the lock if this guard still owns it.
    ///
    /// Resets the lock's attempt counter on success and increments it on
    /// failure. Returns `false` when the lock was reclaimed by someone else in
    /// the meantime; their lock is left untouched.
    pub fn release(&self, guard: LockGuard, reason: ReleaseReason) -> Result<bool> {
        for _ in 0..WRITE_RETRIES {
            let session = self.load(&guard.session_id)?;
            let current = LockState::read(&session, guard.stage);

            if current.holder.as_deref() != Some(guard.holder.as_str()) {
                warn!(
                    session_id = %guard.session_id,
                    stage = guard.stage.as_str(),
                    "Stage lock changed hands before release"
                );
                return Ok(false);
            }

            let released = LockState {
                busy: false,
                started_at: None,
                holder: None,
                attempts: match reason {
                    ReleaseReason::Succeeded => 0,
                    ReleaseReason::Failed => current.attempts + 1,
                },
            };

            match self.store.update_session_metadata(
                &guard.session_id,
                &released.patch(guard.stage)?,
                session.version,
            )? {
                MetadataWrite::Applied { .. } => {
                    info!(
                        session_id = %guard.session_id,
                        stage = guard.stage.as_str(),
                        ?reason,
                        held_ms = (Utc::now() - guard.started_at).num_milliseconds(),
                        "Released stage lock"
                    );
                    return Ok(true);
                }
                MetadataWrite::Conflict => continue,
            }
        }

        Err(IntakeError::Storage(format!(
            "Could not release {} lock for session {}: metadata kept changing",
            guard.stage.as_str(),
            guard.session_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySessionStore, SessionStore};
    use crate::types::{
        CostUsage, Document, InsertOutcome, SessionStatus, StageRecord, StageRecordPatch,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TTL: Duration = Duration::from_secs(600);

    fn setup() -> (Arc<MemorySessionStore>, StageLock) {
        let store = Arc::new(MemorySessionStore::new());
        store.create_session(&Session::new("s1")).unwrap();
        let lock = StageLock::new(store.clone(), TTL);
        (store, lock)
    }

    fn plant(store: &MemorySessionStore, stage: Stage, state: LockState) {
        let session = store.get_session("s1").unwrap().unwrap();
        store
            .update_session_metadata("s1", &state.patch(stage).unwrap(), session.version)
            .unwrap();
    }

    #[test]
    fn test_second_caller_sees_held() {
        let (_store, lock) = setup();

        let first = lock.try_acquire("s1", Stage::QuestionGeneration).unwrap();
        assert!(matches!(first, LockOutcome::Acquired(_)));

        let second = lock.try_acquire("s1", Stage::QuestionGeneration).unwrap();
        assert!(matches!(second, LockOutcome::HeldByOther { .. }));

        // Other stages are independent
        let report = lock.try_acquire("s1", Stage::ReportGeneration).unwrap();
        assert!(matches!(report, LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (store, _) = setup();
        let shared: SharedStore = store;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = StageLock::new(Arc::clone(&shared), TTL);
                std::thread::spawn(move || lock.try_acquire("s1", Stage::QuestionGeneration).unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| !matches!(o, LockOutcome::HeldByOther { .. }))
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_abandoned_lock_is_reclaimed_once() {
        let (store, _) = setup();
        let stale_start = Utc::now() - chrono::Duration::minutes(11);
        plant(
            &store,
            Stage::ReportGeneration,
            LockState::held("crashed-worker", stale_start, 1),
        );

        let shared: SharedStore = store;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = StageLock::new(Arc::clone(&shared), TTL);
                std::thread::spawn(move || lock.try_acquire("s1", Stage::ReportGeneration).unwrap())
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let reclaimed: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                LockOutcome::Reclaimed {
                    previous_started_at,
                    ..
                } => Some(*previous_started_at),
                _ => None,
            })
            .collect();

        assert_eq!(reclaimed, vec![Some(stale_start)]);
        assert!(
            outcomes
                .iter()
                .all(|o| !matches!(o, LockOutcome::Acquired(_)))
        );
    }

    #[test]
    fn test_fresh_lock_is_not_reclaimed() {
        let (store, lock) = setup();
        let start = Utc::now() - chrono::Duration::minutes(9);
        plant(&store, Stage::ReportGeneration, LockState::held("worker", start, 0));

        match lock.try_acquire("s1", Stage::ReportGeneration).unwrap() {
            LockOutcome::HeldByOther { started_at } => assert_eq!(started_at, start),
            other => panic!("expected HeldByOther, got {:?}", other),
        }
    }

    #[test]
    fn test_release_tracks_attempts() {
        let (store, lock) = setup();

        let guard = lock
            .try_acquire("s1", Stage::QuestionGeneration)
            .unwrap()
            .into_guard()
            .unwrap();
        assert!(lock.release(guard, ReleaseReason::Failed).unwrap());

        let state = LockState::read(&store.get_session("s1").unwrap().unwrap(), Stage::QuestionGeneration);
        assert!(!state.busy);
        assert_eq!(state.attempts, 1);
        assert!(state.started_at.is_none());

        let guard = lock
            .try_acquire("s1", Stage::QuestionGeneration)
            .unwrap()
            .into_guard()
            .unwrap();
        lock.release(guard, ReleaseReason::Succeeded).unwrap();
        let state = LockState::read(&store.get_session("s1").unwrap().unwrap(), Stage::QuestionGeneration);
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_reset_skips_live_lock() {
        let (store, lock) = setup();
        plant(&store, Stage::ReportGeneration, LockState::held("worker", Utc::now(), 2));
        assert!(lock.is_held("s1", Stage::ReportGeneration).unwrap());
        assert!(!lock.reset("s1", Stage::ReportGeneration).unwrap());

        let stale = Utc::now() - chrono::Duration::minutes(30);
        plant(&store, Stage::ReportGeneration, LockState::held("worker", stale, 2));
        assert!(!lock.is_held("s1", Stage::ReportGeneration).unwrap());
        assert!(lock.reset("s1", Stage::ReportGeneration).unwrap());
        let state = LockState::read(&store.get_session("s1").unwrap().unwrap(), Stage::ReportGeneration);
        assert_eq!(state, LockState::default());
    }

    #[test]
    fn test_release_after_reclaim_leaves_new_owner() {
        let (store, lock) = setup();
        let guard = lock
            .try_acquire("s1", Stage::ReportGeneration)
            .unwrap()
            .into_guard()
            .unwrap();

        // Someone reclaimed it after our TTL ran out
        plant(
            &store,
            Stage::ReportGeneration,
            LockState::held("new-owner", Utc::now(), 0),
        );

        assert!(!lock.release(guard, ReleaseReason::Succeeded).unwrap());
        let state = LockState::read(&store.get_session("s1").unwrap().unwrap(), Stage::ReportGeneration);
        assert_eq!(state.holder.as_deref(), Some("new-owner"));
        assert!(state.busy);
    }
    #[test]
    fn test_refresh_extends_live_lock() {
        let (store, _) = setup();
        let lock = StageLock::new(store.clone(), Duration::from_secs(60));
        let start = Utc::now() - chrono::Duration::seconds(59);
        plant(&store, Stage::ReportGeneration, LockState::held("worker", start, 1));

        assert!(lock.refresh("s1", Stage::ReportGeneration, "worker").unwrap());
        let state = LockState::read(&store.get_session("s1").unwrap().unwrap(), Stage::ReportGeneration);
        assert!(state.started_at.unwrap() > start);
        assert_eq!(state.attempts, 1);

        // Still held after the original TTL would have run out
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(lock.is_held("s1", Stage::ReportGeneration).unwrap());
    }

    #[test]
    fn test_refresh_fails_after_takeover() {
        let (store, lock) = setup();
        let guard = lock
            .try_acquire("s1", Stage::QuestionGeneration)
            .unwrap()
            .into_guard()
            .unwrap();
        plant(
            &store,
            Stage::QuestionGeneration,
            LockState::held("new-owner", Utc::now(), 0),
        );

        assert!(!lock.refresh("s1", Stage::QuestionGeneration, &guard.holder).unwrap());
        let state = LockState::read(&store.get_session("s1").unwrap().unwrap(), Stage::QuestionGeneration);
        assert_eq!(state.holder.as_deref(), Some("new-owner"));

        // Released locks are not revived either
        plant(&store, Stage::QuestionGeneration, LockState::default());
        assert!(!lock.refresh("s1", Stage::QuestionGeneration, "new-owner").unwrap());
    }

    /// Store that slips one unrelated metadata write in before the first
    /// compare-and-swap it sees
    struct InterleavedStore {
        inner: MemorySessionStore,
        fired: AtomicBool,
    }

    impl SessionStore for InterleavedStore {
        fn create_session(&self, session: &Session) -> Result<()> {
            self.inner.create_session(session)
        }
        fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
            self.inner.get_session(session_id)
        }
        fn update_session_metadata(
            &self,
            session_id: &str,
            patch: &Map<String, Value>,
            expected_version: u64,
        ) -> Result<MetadataWrite> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let mut other = Map::new();
                other.insert("client_name".to_string(), Value::from("Acme Clinics"));
                self.inner
                    .update_session_metadata(session_id, &other, expected_version)?;
            }
            self.inner
                .update_session_metadata(session_id, patch, expected_version)
        }
        fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
            self.inner.set_session_status(session_id, status)
        }
        fn add_session_cost(&self, session_id: &str, cost: &CostUsage) -> Result<f64> {
            self.inner.add_session_cost(session_id, cost)
        }
        fn get_stage_record(
            &self,
            session_id: &str,
            subject_id: &str,
            stage: Stage,
        ) -> Result<Option<StageRecord>> {
            self.inner.get_stage_record(session_id, subject_id, stage)
        }
        fn insert_stage_record(&self, record: &StageRecord) -> Result<InsertOutcome> {
            self.inner.insert_stage_record(record)
        }
        fn update_stage_record(&self, record_id: &str, patch: &StageRecordPatch) -> Result<()> {
            self.inner.update_stage_record(record_id, patch)
        }
        fn delete_stage_record(&self, record_id: &str) -> Result<()> {
            self.inner.delete_stage_record(record_id)
        }
        fn list_stage_records(&self, session_id: &str, stage: Stage) -> Result<Vec<StageRecord>> {
            self.inner.list_stage_records(session_id, stage)
        }
        fn add_document(&self, document: &Document) -> Result<()> {
            self.inner.add_document(document)
        }
        fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
            self.inner.get_document(document_id)
        }
        fn list_documents(&self, session_id: &str) -> Result<Vec<Document>> {
            self.inner.list_documents(session_id)
        }
    }

    #[test]
    fn test_unrelated_metadata_write_does_not_block_free_lock() {
        let store = Arc::new(InterleavedStore {
            inner: MemorySessionStore::new(),
            fired: AtomicBool::new(false),
        });
        store.create_session(&Session::new("s1")).unwrap();
        let lock = StageLock::new(store.clone(), TTL);

        let outcome = lock.try_acquire("s1", Stage::QuestionGeneration).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.metadata["client_name"], "Acme Clinics");
        assert!(LockState::read(&session, Stage::QuestionGeneration).busy);
    }
}
