//! intakeflow - Project Intake Analysis Pipeline
//!
//! Turns the documents a prospective client uploads into clarifying questions
//! and a multi-part feasibility report, using a language model for each step.
//!
//! ## Guarantees
//!
//! - **At most one run per stage**: a lock in session metadata, acquired by
//!   compare-and-swap, keeps concurrent callers from paying for the same call
//! - **Bounded retries**: each call retries transient failures with linear
//!   backoff; each stage is attempted at most a fixed number of times
//! - **Nothing lost to truncation**: partial streams are kept, unterminated
//!   streams get synthesized usage, broken JSON is repaired or backfilled
//! - **Exact cost accounting**: every successful call is added to the session
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use intakeflow::{ConfigLoader, Database, PipelineOrchestrator, ai::create_client};
//!
//! let config = ConfigLoader::load()?;
//! let db = Arc::new(Database::open(&config.storage.database_path)?);
//! db.initialize()?;
//! let client = create_client(&config.llm)?;
//! let pipeline = PipelineOrchestrator::new(db, client, &config);
//! let report = pipeline.run(&session_id).await?;
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: completion clients, retry policy, response recovery
//! - [`pipeline`]: stage lock, phase orchestration, pipeline orchestrator
//! - [`storage`]: SQLite and in-memory session stores
//! - [`config`]: layered configuration

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

// =============================================================================
// Core Re-exports
// =============================================================================

pub use config::{Config, ConfigLoader};

pub use types::error::{ErrorKind, IntakeError, LlmError, Result, ResultExt};

pub use storage::database::PoolConfig;
pub use storage::{Database, MemorySessionStore, SessionStore, SharedDatabase, SharedStore};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{
    LockOutcome, MergedResult, PhaseOrchestrator, PhaseSpec, PipelineOrchestrator, StageLock,
};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{
    CompletionClient, CompletionRequest, CompletionResponse, ResponseRecoveryParser, RetryPolicy,
    SharedClient, with_timeout,
};
