//! Stage record bookkeeping
//!
//! A stage record is written in `Processing` before the external call starts.
//! `Completed` short-circuits every later request; `Failed` (or an orphaned
//! `Processing` record) is replaced by a fresh attempt until the attempt
//! ceiling is reached. A running attempt renews its [`Lease`] before every
//! billed call so neither its record nor its stage lock ever looks orphaned.

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::lock::{LockGuard, StageLock};
use crate::ai::recovery::schema::is_empty_value;
use crate::storage::SessionStore;
use crate::types::{
    InsertOutcome, IntakeError, Question, Result, Stage, StageRecord, StageRecordPatch,
    StageStatus, json_string_or,
};

/// Outcome of claiming the right to run a stage attempt
#[derive(Debug)]
pub enum Claim {
    /// Already done; reuse the stored result
    Completed(StageRecord),
    /// A live attempt is running elsewhere
    InProgress(StageRecord),
    /// This caller owns the new `Processing` record
    Claimed(StageRecord),
}

/// Result produced by one stage attempt
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub result: Value,
    pub recovered: bool,
}

/// Claim `(session, subject, stage)`.
///
/// `orphaned` decides whether an existing `Processing` record belongs to a
/// dead attempt and may be replaced.
pub fn claim_record(
    store: &dyn SessionStore,
    session_id: &str,
    subject_id: &str,
    stage: Stage,
    ceiling: u32,
    orphaned: impl Fn(&StageRecord) -> bool,
) -> Result<Claim> {
    // A lost insert race means someone else just claimed; look once more
    for _ in 0..2 {
        let attempts = match store.get_stage_record(session_id, subject_id, stage)? {
            Some(existing) => match existing.status {
                StageStatus::Completed => return Ok(Claim::Completed(existing)),
                StageStatus::Processing if !orphaned(&existing) => {
                    return Ok(Claim::InProgress(existing));
                }
                StageStatus::Processing | StageStatus::Failed => {
                    if existing.attempts >= ceiling {
                        if existing.status == StageStatus::Processing {
                            store.update_stage_record(
                                &existing.id,
                                &StageRecordPatch::failed("attempt abandoned"),
                            )?;
                        }
                        return Err(IntakeError::RetryLimitExceeded {
                            session_id: session_id.to_string(),
                            stage,
                            attempts: existing.attempts,
                        });
                    }
                    debug!(
                        session_id,
                        subject_id,
                        stage = stage.as_str(),
                        previous_attempts = existing.attempts,
                        "Replacing failed stage attempt"
                    );
                    store.delete_stage_record(&existing.id)?;
                    existing.attempts + 1
                }
            },
            None => 1,
        };

        let record = StageRecord::processing(session_id, subject_id, stage, attempts);
        match store.insert_stage_record(&record)? {
            InsertOutcome::Inserted => return Ok(Claim::Claimed(record)),
            InsertOutcome::Conflict => continue,
        }
    }

    match store.get_stage_record(session_id, subject_id, stage)? {
        Some(record) if record.is_completed() => Ok(Claim::Completed(record)),
        Some(record) => Ok(Claim::InProgress(record)),
        None => Err(IntakeError::Storage(format!(
            "{} record for session {} vanished while claiming",
            stage.as_str(),
            session_id
        ))),
    }
}

/// Persist the attempt's outcome and return the stored record
pub fn finish_record(
    store: &dyn SessionStore,
    record: &StageRecord,
    outcome: &Result<StageOutput>,
) -> Result<StageRecord> {
    let patch = match outcome {
        Ok(output) => StageRecordPatch::completed(output.result.clone(), output.recovered),
        Err(err) => {
            warn!(
                session_id = %record.session_id,
                stage = record.stage.as_str(),
                attempt = record.attempts,
                error = %err,
                "Stage attempt failed"
            );
            StageRecordPatch::failed(err.to_string())
        }
    };
    store.update_stage_record(&record.id, &patch)?;

    store
        .get_stage_record(&record.session_id, &record.subject_id, record.stage)?
        .ok_or_else(|| IntakeError::NotFound(format!("Stage record {}", record.id)))
}

/// Liveness claim of one running attempt: its `Processing` record and,
/// when the attempt runs under a stage lock, that lock
pub struct Lease {
    lock: StageLock,
    session_id: String,
    stage: Stage,
    record_id: String,
    holder: Option<String>,
}

impl Lease {
    /// Lease on `record`, also refreshing the lock behind `guard` if given
    pub fn new(lock: &StageLock, record: &StageRecord, guard: Option<&LockGuard>) -> Self {
        Self {
            lock: lock.clone(),
            session_id: record.session_id.clone(),
            stage: record.stage,
            record_id: record.id.clone(),
            holder: guard.map(|g| g.holder.clone()),
        }
    }

    /// Mark the attempt alive. Fails with `LeaseLost` once the lock or the
    /// record belongs to someone else.
    pub fn renew(&self) -> Result<()> {
        if let Some(holder) = &self.holder {
            match self.lock.refresh(&self.session_id, self.stage, holder) {
                Ok(true) => {}
                Ok(false) => return Err(self.lost()),
                // A missed refresh only narrows the TTL margin
                Err(err) => warn!(
                    session_id = %self.session_id,
                    stage = self.stage.as_str(),
                    error = %err,
                    "Could not refresh stage lock"
                ),
            }
        }

        match self
            .lock
            .store()
            .update_stage_record(&self.record_id, &StageRecordPatch::default())
        {
            Err(IntakeError::NotFound(_)) => Err(self.lost()),
            other => other,
        }
    }

    fn lost(&self) -> IntakeError {
        warn!(
            session_id = %self.session_id,
            stage = self.stage.as_str(),
            "Attempt lease lost"
        );
        IntakeError::LeaseLost {
            session_id: self.session_id.clone(),
            stage: self.stage,
        }
    }
}

// =============================================================================
// Result Conversion
// =============================================================================

/// Normalize parsed question output into questions with stable ids.
///
/// Entries may be plain strings or `{text|question, category, rationale}`
/// objects; placeholder entries are dropped.
pub fn normalize_questions(record: &Value) -> Vec<Question> {
    let items = record
        .get("questions")
        .and_then(|q| q.as_array())
        .cloned()
        .unwrap_or_default();

    items
        .iter()
        .filter(|item| !is_empty_value(item))
        .filter_map(|item| match item {
            Value::String(text) => Some((text.trim().to_string(), String::new(), String::new())),
            Value::Object(_) => {
                let text = item
                    .get("text")
                    .or_else(|| item.get("question"))
                    .and_then(|t| t.as_str())?
                    .trim()
                    .to_string();
                Some((
                    text,
                    json_string_or(item, "category", ""),
                    json_string_or(item, "rationale", ""),
                ))
            }
            _ => None,
        })
        .filter(|(text, _, _)| !text.is_empty())
        .enumerate()
        .map(|(i, (text, category, rationale))| Question {
            id: format!("q{}", i + 1),
            text,
            category,
            rationale,
        })
        .collect()
}

pub fn questions_result(questions: &[Question]) -> Value {
    json!({ "questions": questions })
}

/// Questions stored in a completed question-generation record
pub fn questions_from_record(record: &StageRecord) -> Result<Vec<Question>> {
    let questions = record
        .result
        .as_ref()
        .and_then(|r| r.get("questions"))
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    Ok(serde_json::from_value(questions)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::lock::ReleaseReason;
    use crate::storage::MemorySessionStore;
    use crate::types::Session;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> MemorySessionStore {
        let store = MemorySessionStore::new();
        store.create_session(&Session::new("s1")).unwrap();
        store
    }

    fn fail(store: &MemorySessionStore, record: &StageRecord) {
        store
            .update_stage_record(&record.id, &StageRecordPatch::failed("boom"))
            .unwrap();
    }

    #[test]
    fn test_claim_lifecycle_until_ceiling() {
        let store = store();
        let stage = Stage::QuestionGeneration;

        for expected_attempt in 1..=3 {
            let Claim::Claimed(record) = claim_record(&store, "s1", "", stage, 3, |_| false).unwrap()
            else {
                panic!("expected a claim on attempt {}", expected_attempt);
            };
            assert_eq!(record.attempts, expected_attempt);
            fail(&store, &record);
        }

        let err = claim_record(&store, "s1", "", stage, 3, |_| false).unwrap_err();
        assert!(matches!(
            err,
            IntakeError::RetryLimitExceeded { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_claim_reports_existing_states() {
        let store = store();
        let stage = Stage::DocumentAnalysis;

        let Claim::Claimed(record) = claim_record(&store, "s1", "doc", stage, 3, |_| false).unwrap()
        else {
            panic!("expected claim");
        };
        assert!(matches!(
            claim_record(&store, "s1", "doc", stage, 3, |_| false).unwrap(),
            Claim::InProgress(_)
        ));

        // Orphaned processing records are replaced
        assert!(matches!(
            claim_record(&store, "s1", "doc", stage, 3, |_| true).unwrap(),
            Claim::Claimed(StageRecord { attempts: 2, .. })
        ));

        let current = store.get_stage_record("s1", "doc", stage).unwrap().unwrap();
        assert_ne!(current.id, record.id);
        let outcome = Ok(StageOutput {
            result: json!({"summary": "x"}),
            recovered: false,
        });
        let done = finish_record(&store, &current, &outcome).unwrap();
        assert!(done.is_completed());
        assert!(matches!(
            claim_record(&store, "s1", "doc", stage, 3, |_| true).unwrap(),
            Claim::Completed(_)
        ));
    }

    #[test]
    fn test_normalize_questions() {
        let parsed = json!({
            "questions": [
                "What is the launch date?",
                {"question": "Who hosts it?", "category": "infra"},
                {"text": "  "},
                "questions unconfirmed, needs follow-up",
                42
            ]
        });

        let questions = normalize_questions(&parsed);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "q1");
        assert_eq!(questions[1].text, "Who hosts it?");
        assert_eq!(questions[1].category, "infra");

        let record = StageRecord {
            result: Some(questions_result(&questions)),
            ..StageRecord::processing("s1", "", Stage::QuestionGeneration, 1)
        };
        assert_eq!(questions_from_record(&record).unwrap(), questions);
    }

    #[test]
    fn test_lease_renew_touches_record() {
        let store = Arc::new(store());
        let lock = StageLock::new(store.clone(), Duration::from_secs(600));
        let Claim::Claimed(record) =
            claim_record(store.as_ref(), "s1", "doc", Stage::DocumentAnalysis, 3, |_| false).unwrap()
        else {
            panic!("expected claim");
        };

        std::thread::sleep(Duration::from_millis(20));
        Lease::new(&lock, &record, None).renew().unwrap();

        let touched = store
            .get_stage_record("s1", "doc", Stage::DocumentAnalysis)
            .unwrap()
            .unwrap();
        assert!(touched.updated_at > record.updated_at);
        assert_eq!(touched.status, StageStatus::Processing);
    }

    #[test]
    fn test_lease_lost_when_record_replaced_or_lock_taken() {
        let store = Arc::new(store());
        let lock = StageLock::new(store.clone(), Duration::from_secs(600));
        let stage = Stage::QuestionGeneration;
        let guard = lock.try_acquire("s1", stage).unwrap().into_guard().unwrap();
        let Claim::Claimed(record) = claim_record(store.as_ref(), "s1", "", stage, 3, |_| false).unwrap()
        else {
            panic!("expected claim");
        };

        let lease = Lease::new(&lock, &record, Some(&guard));
        lease.renew().unwrap();

        lock.release(guard, ReleaseReason::Failed).unwrap();
        assert!(matches!(lease.renew(), Err(IntakeError::LeaseLost { .. })));

        store.delete_stage_record(&record.id).unwrap();
        let unlocked = Lease::new(&lock, &record, None);
        assert!(matches!(unlocked.renew(), Err(IntakeError::LeaseLost { .. })));
    }
}
