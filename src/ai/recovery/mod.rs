//! Response Recovery
//!
//! Structured-record recovery for model output that may be fenced, wrapped
//! in prose, truncated, or not JSON at all.
//!
//! - `parser`: strategy chain producing a [`ParsedRecord`]
//! - `repair`: text-level JSON repairs
//! - `heuristic`: line-oriented section extraction
//! - `schema`: required fields and placeholder backfill

mod heuristic;
mod parser;
mod repair;
pub mod schema;

pub use parser::{ParsedRecord, RecoveryStrategy, ResponseRecoveryParser};
pub use schema::{FieldKind, FieldSpec, RecordSchema, is_empty_value, is_placeholder, placeholder_text};
