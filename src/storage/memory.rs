//! In-process session store
//!
//! `DashMap` entry guards give the same single-row atomicity the SQLite store
//! gets from its versioned `UPDATE`. Used by tests and short-lived runs that do
//! not need persistence.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};

use super::store::{SessionStore, apply_metadata_patch};
use crate::types::{
    CostUsage, Document, InsertOutcome, IntakeError, MetadataWrite, Result, Session,
    SessionStatus, Stage, StageRecord, StageRecordPatch,
};

type RecordKey = (String, String, Stage);

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    /// Stage records by id, with insertion sequence
    records: DashMap<String, (u64, StageRecord)>,
    /// Unique (session, subject, stage) -> record id
    record_keys: DashMap<RecordKey, String>,
    documents: DashMap<String, (u64, Document)>,
    seq: AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn missing_session(session_id: &str) -> IntakeError {
        IntakeError::NotFound(format!("Session {}", session_id))
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&self, session: &Session) -> Result<()> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(IntakeError::Storage(format!(
                "Session {} already exists",
                session.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    fn update_session_metadata(
        &self,
        session_id: &str,
        patch: &Map<String, Value>,
        expected_version: u64,
    ) -> Result<MetadataWrite> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::missing_session(session_id))?;

        if session.version != expected_version {
            return Ok(MetadataWrite::Conflict);
        }

        apply_metadata_patch(&mut session.metadata, patch);
        session.version += 1;
        session.updated_at = Utc::now();

        Ok(MetadataWrite::Applied {
            version: session.version,
        })
    }

    fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::missing_session(session_id))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    fn add_session_cost(&self, session_id: &str, cost: &CostUsage) -> Result<f64> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::missing_session(session_id))?;
        session.total_cost += cost.cost_usd.max(0.0);
        session.updated_at = Utc::now();
        Ok(session.total_cost)
    }

    fn get_stage_record(
        &self,
        session_id: &str,
        subject_id: &str,
        stage: Stage,
    ) -> Result<Option<StageRecord>> {
        let key = (session_id.to_string(), subject_id.to_string(), stage);
        let Some(id) = self.record_keys.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.records.get(&id).map(|r| r.1.clone()))
    }

    fn insert_stage_record(&self, record: &StageRecord) -> Result<InsertOutcome> {
        let key = (
            record.session_id.clone(),
            record.subject_id.clone(),
            record.stage,
        );

        match self.record_keys.entry(key) {
            Entry::Occupied(_) => Ok(InsertOutcome::Conflict),
            Entry::Vacant(slot) => {
                self.records
                    .insert(record.id.clone(), (self.next_seq(), record.clone()));
                slot.insert(record.id.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    fn update_stage_record(&self, record_id: &str, patch: &StageRecordPatch) -> Result<()> {
        let mut entry = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| IntakeError::NotFound(format!("Stage record {}", record_id)))?;
        let record = &mut entry.1;

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(result) = &patch.result {
            record.result = Some(result.clone());
        }
        record.error = patch.error.clone();
        if let Some(recovered) = patch.recovered {
            record.recovered = recovered;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    fn delete_stage_record(&self, record_id: &str) -> Result<()> {
        if let Some((_, (_, record))) = self.records.remove(record_id) {
            let key = (record.session_id, record.subject_id, record.stage);
            self.record_keys.remove_if(&key, |_, id| id == record_id);
        }
        Ok(())
    }

    fn list_stage_records(&self, session_id: &str, stage: Stage) -> Result<Vec<StageRecord>> {
        let mut records: Vec<(u64, StageRecord)> = self
            .records
            .iter()
            .filter(|r| r.1.session_id == session_id && r.1.stage == stage)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    fn add_document(&self, document: &Document) -> Result<()> {
        if !self.sessions.contains_key(&document.session_id) {
            return Err(Self::missing_session(&document.session_id));
        }
        self.documents
            .insert(document.id.clone(), (self.next_seq(), document.clone()));
        Ok(())
    }

    fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        Ok(self.documents.get(document_id).map(|d| d.1.clone()))
    }

    fn list_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        let mut documents: Vec<(u64, Document)> = self
            .documents
            .iter()
            .filter(|d| d.1.session_id == session_id)
            .map(|d| d.value().clone())
            .collect();
        documents.sort_by_key(|(seq, _)| *seq);
        Ok(documents.into_iter().map(|(_, d)| d).collect())
    }
}
