//! Database Layer with Connection Pooling and Safe Transactions
//!
//! SQLite implementation of [`SessionStore`]:
//! - Connection pooling via r2d2 for concurrent access
//! - Panic-safe transactions with automatic rollback
//! - Versioned metadata writes (`UPDATE ... WHERE version = ?`)
//! - WAL mode for concurrent readers during writes

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::{Map, Value};

use super::store::{SessionStore, apply_metadata_patch};
use crate::types::{
    CostUsage, Document, InsertOutcome, IntakeError, MetadataWrite, Result, ResultExt, Session,
    SessionStatus, Stage, StageRecord, StageRecordPatch, StageStatus, log_filter_error,
};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version for migration tracking
const SCHEMA_VERSION: u32 = 1;

const SESSION_COLUMNS: &str =
    "id, status, metadata, total_cost, version, created_at, updated_at";

const STAGE_COLUMNS: &str = "id, session_id, subject_id, stage, status, result, error, attempts, \
     recovered, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, session_id, filename, content, created_at";

/// Connection pool configuration
///
/// Pool size is dynamically calculated based on CPU cores.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,
    /// Minimum idle connections to keep ready
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 4;
    const MAX_POOL_SIZE: u32 = 16;

    /// clamp(cores * 2, MIN, MAX)
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);

        (cores * 2).clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(1),
            connection_timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Thread-safe database with connection pooling.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open database with connection pooling at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    /// Open database with custom pool configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| {
                IntakeError::Storage(format!("Failed to create connection pool: {}", e))
            })?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for testing or temporary use.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(1).build(manager).map_err(|e| {
            IntakeError::Storage(format!("Failed to create in-memory pool: {}", e))
        })?;

        Ok(Self { pool })
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = -16000;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            IntakeError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;

        let current: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to set schema version")?;
            tracing::debug!(version = SCHEMA_VERSION, "Initialized session store schema");
        }

        Ok(())
    }

    /// Execute a function within a panic-safe write transaction.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`) so a read inside
    /// the closure cannot go stale before its write. If the closure errors or
    /// panics the transaction is rolled back on drop.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context("Failed to start transaction")?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(panic_payload) => {
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(IntakeError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }

    fn read_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![session_id],
                SessionRow::from_row,
            )
            .optional()
            .with_context("Failed to load session")?;

        row.map(SessionRow::into_session).transpose()
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context_fn(|| format!("Invalid timestamp '{}'", raw))
}

fn parse_json(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(IntakeError::from)
}

struct SessionRow {
    id: String,
    status: String,
    metadata: String,
    total_cost: f64,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            metadata: row.get(2)?,
            total_cost: row.get(3)?,
            version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let metadata = match serde_json::from_str::<Value>(&self.metadata)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Ok(Session {
            status: self.status.parse().map_err(IntakeError::Storage)?,
            metadata,
            total_cost: self.total_cost,
            version: self.version.max(0) as u64,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            id: self.id,
        })
    }
}

struct StageRow {
    id: String,
    session_id: String,
    subject_id: String,
    stage: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    recovered: bool,
    created_at: String,
    updated_at: String,
}

impl StageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            subject_id: row.get(2)?,
            stage: row.get(3)?,
            status: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            attempts: row.get(7)?,
            recovered: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<StageRecord> {
        Ok(StageRecord {
            stage: self.stage.parse::<Stage>().map_err(IntakeError::Storage)?,
            status: self
                .status
                .parse::<StageStatus>()
                .map_err(IntakeError::Storage)?,
            result: parse_json(self.result)?,
            error: self.error,
            attempts: self.attempts.max(0) as u32,
            recovered: self.recovered,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            id: self.id,
            session_id: self.session_id,
            subject_id: self.subject_id,
        })
    }
}

struct DocumentRow {
    id: String,
    session_id: String,
    filename: String,
    content: String,
    created_at: String,
}

impl DocumentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            filename: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        Ok(Document {
            created_at: parse_time(&self.created_at)?,
            id: self.id,
            session_id: self.session_id,
            filename: self.filename,
            content: self.content,
        })
    }
}

// =============================================================================
// SessionStore
// =============================================================================

impl SessionStore for Database {
    fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (id, status, metadata, total_cost, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                session.status.as_str(),
                serde_json::to_string(&session.metadata)?,
                session.total_cost,
                session.version as i64,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )
        .with_context_fn(|| format!("Failed to create session {}", session.id))?;

        tracing::debug!(session_id = %session.id, "Created session");
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        Self::read_session(&conn, session_id)
    }

    fn update_session_metadata(
        &self,
        session_id: &str,
        patch: &Map<String, Value>,
        expected_version: u64,
    ) -> Result<MetadataWrite> {
        self.transaction(|conn| {
            let session = Self::read_session(conn, session_id)?
                .ok_or_else(|| IntakeError::NotFound(format!("Session {}", session_id)))?;

            if session.version != expected_version {
                return Ok(MetadataWrite::Conflict);
            }

            let mut metadata = session.metadata;
            apply_metadata_patch(&mut metadata, patch);

            let updated = conn
                .execute(
                    "UPDATE sessions SET metadata = ?1, version = version + 1, updated_at = ?2
                     WHERE id = ?3 AND version = ?4",
                    params![
                        serde_json::to_string(&metadata)?,
                        Utc::now().to_rfc3339(),
                        session_id,
                        expected_version as i64,
                    ],
                )
                .with_context("Failed to update session metadata")?;

            if updated == 0 {
                return Ok(MetadataWrite::Conflict);
            }

            Ok(MetadataWrite::Applied {
                version: expected_version + 1,
            })
        })
    }

    fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), session_id],
            )
            .with_context("Failed to update session status")?;

        if updated == 0 {
            return Err(IntakeError::NotFound(format!("Session {}", session_id)));
        }
        Ok(())
    }

    fn add_session_cost(&self, session_id: &str, cost: &CostUsage) -> Result<f64> {
        let conn = self.conn()?;
        let total: Option<f64> = conn
            .query_row(
                "UPDATE sessions SET total_cost = total_cost + ?1, updated_at = ?2
                 WHERE id = ?3 RETURNING total_cost",
                params![cost.cost_usd.max(0.0), Utc::now().to_rfc3339(), session_id],
                |row| row.get(0),
            )
            .optional()
            .with_context("Failed to add session cost")?;

        total.ok_or_else(|| IntakeError::NotFound(format!("Session {}", session_id)))
    }

    fn get_stage_record(
        &self,
        session_id: &str,
        subject_id: &str,
        stage: Stage,
    ) -> Result<Option<StageRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM stage_records
                     WHERE session_id = ?1 AND subject_id = ?2 AND stage = ?3",
                    STAGE_COLUMNS
                ),
                params![session_id, subject_id, stage.as_str()],
                StageRow::from_row,
            )
            .optional()
            .with_context("Failed to load stage record")?;

        row.map(StageRow::into_record).transpose()
    }

    fn insert_stage_record(&self, record: &StageRecord) -> Result<InsertOutcome> {
        let conn = self.conn()?;
        let result = record.result.as_ref().map(serde_json::to_string).transpose()?;

        let inserted = conn
            .execute(
                "INSERT INTO stage_records
                 (id, session_id, subject_id, stage, status, result, error, attempts, recovered, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(session_id, subject_id, stage) DO NOTHING",
                params![
                    record.id,
                    record.session_id,
                    record.subject_id,
                    record.stage.as_str(),
                    record.status.as_str(),
                    result,
                    record.error,
                    record.attempts,
                    record.recovered,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context("Failed to insert stage record")?;

        Ok(if inserted == 0 {
            InsertOutcome::Conflict
        } else {
            InsertOutcome::Inserted
        })
    }

    fn update_stage_record(&self, record_id: &str, patch: &StageRecordPatch) -> Result<()> {
        let conn = self.conn()?;
        let result = patch.result.as_ref().map(serde_json::to_string).transpose()?;

        let updated = conn
            .execute(
                "UPDATE stage_records SET
                    status = COALESCE(?1, status),
                    result = COALESCE(?2, result),
                    error = ?3,
                    recovered = COALESCE(?4, recovered),
                    updated_at = ?5
                 WHERE id = ?6",
                params![
                    patch.status.map(|s| s.as_str()),
                    result,
                    patch.error,
                    patch.recovered,
                    Utc::now().to_rfc3339(),
                    record_id,
                ],
            )
            .with_context("Failed to update stage record")?;

        if updated == 0 {
            return Err(IntakeError::NotFound(format!("Stage record {}", record_id)));
        }
        Ok(())
    }

    fn delete_stage_record(&self, record_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM stage_records WHERE id = ?1", params![record_id])
            .with_context("Failed to delete stage record")?;
        Ok(())
    }

    fn list_stage_records(&self, session_id: &str, stage: Stage) -> Result<Vec<StageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM stage_records WHERE session_id = ?1 AND stage = ?2
                 ORDER BY created_at, rowid",
                STAGE_COLUMNS
            ))
            .with_context("Failed to prepare stage record query")?;

        let rows = stmt
            .query_map(params![session_id, stage.as_str()], StageRow::from_row)
            .with_context("Failed to list stage records")?;

        rows.filter_map(|r| log_filter_error(r, "Skipping unreadable stage record"))
            .map(StageRow::into_record)
            .collect()
    }

    fn add_document(&self, document: &Document) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO documents (id, session_id, filename, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                document.id,
                document.session_id,
                document.filename,
                document.content,
                document.created_at.to_rfc3339(),
            ],
        )
        .with_context_fn(|| format!("Failed to add document {}", document.filename))?;
        Ok(())
    }

    fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
                params![document_id],
                DocumentRow::from_row,
            )
            .optional()
            .with_context("Failed to load document")?;

        row.map(DocumentRow::into_document).transpose()
    }

    fn list_documents(&self, session_id: &str) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents WHERE session_id = ?1 ORDER BY created_at, rowid",
                DOCUMENT_COLUMNS
            ))
            .with_context("Failed to prepare document query")?;

        let rows = stmt
            .query_map(params![session_id], DocumentRow::from_row)
            .with_context("Failed to list documents")?;

        rows.filter_map(|r| log_filter_error(r, "Skipping unreadable document"))
            .map(DocumentRow::into_document)
            .collect()
    }
}
