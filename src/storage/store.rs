//! Session store abstraction
//!
//! The pipeline only needs single-row atomic writes: a versioned
//! compare-and-swap on session metadata and a uniquely keyed insert for stage
//! records. Everything else is plain CRUD.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::types::{
    CostUsage, Document, InsertOutcome, MetadataWrite, Result, Session, SessionStatus, Stage,
    StageRecord, StageRecordPatch,
};

/// Shared store handle
pub type SharedStore = Arc<dyn SessionStore>;

/// Persistence used by the pipeline
pub trait SessionStore: Send + Sync {
    // =========================================================================
    // Sessions
    // =========================================================================

    fn create_session(&self, session: &Session) -> Result<()>;

    fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Merge `patch` into the session metadata (top-level keys replaced) iff
    /// the row is still at `expected_version`.
    fn update_session_metadata(
        &self,
        session_id: &str,
        patch: &Map<String, Value>,
        expected_version: u64,
    ) -> Result<MetadataWrite>;

    fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;

    /// Add one call's cost to the session total; returns the new total
    fn add_session_cost(&self, session_id: &str, cost: &CostUsage) -> Result<f64>;

    // =========================================================================
    // Stage Records
    // =========================================================================

    fn get_stage_record(
        &self,
        session_id: &str,
        subject_id: &str,
        stage: Stage,
    ) -> Result<Option<StageRecord>>;

    /// Insert under the unique (session, subject, stage) key
    fn insert_stage_record(&self, record: &StageRecord) -> Result<InsertOutcome>;

    fn update_stage_record(&self, record_id: &str, patch: &StageRecordPatch) -> Result<()>;

    fn delete_stage_record(&self, record_id: &str) -> Result<()>;

    /// Every record of `stage` in the session, oldest first
    fn list_stage_records(&self, session_id: &str, stage: Stage) -> Result<Vec<StageRecord>>;

    // =========================================================================
    // Documents
    // =========================================================================

    fn add_document(&self, document: &Document) -> Result<()>;

    fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    /// Documents of a session, oldest first
    fn list_documents(&self, session_id: &str) -> Result<Vec<Document>>;
}

/// Merge metadata `patch` into `metadata`, replacing top-level keys
pub(crate) fn apply_metadata_patch(metadata: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        metadata.insert(key.clone(), value.clone());
    }
}
