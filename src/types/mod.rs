pub mod error;
pub mod session;
pub mod utils;

pub use error::{ErrorKind, IntakeError, LlmError, Result, ResultExt};
pub use session::{
    CostUsage, Document, InsertOutcome, MetadataWrite, Progress, Question, Report, Session,
    SessionStatus, Stage, StageRecord, StageRecordPatch, StageStatus,
};
pub use utils::{
    estimate_tokens, json_string, json_string_or, log_filter_error, preview,
};
