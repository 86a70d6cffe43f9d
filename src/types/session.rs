//! Core types for the intake pipeline
//!
//! - Session types: Session, SessionStatus
//! - Stage types: Stage, StageStatus, StageRecord, StageRecordPatch
//! - Intake artifacts: Document, Question, Report, Progress
//! - Cost accounting: CostUsage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Session Types
// =============================================================================

/// Overall status of an intake session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Persistent per-session record.
///
/// `metadata` is an open JSON object used both for business metadata and as
/// the bag that holds per-stage lock fields. `version` increases with every
/// metadata write and backs the store's compare-and-swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub metadata: Map<String, Value>,
    pub total_cost: f64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Processing,
            metadata: Map::new(),
            total_cost: 0.0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a versioned metadata write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataWrite {
    /// Patch applied; carries the new row version
    Applied { version: u64 },
    /// Row changed since `expected_version` was read
    Conflict,
}

// =============================================================================
// Stage Types
// =============================================================================

/// One of the three sequential pipeline steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DocumentAnalysis,
    QuestionGeneration,
    ReportGeneration,
}

impl Stage {
    pub const ALL: [Stage; 3] = [
        Stage::DocumentAnalysis,
        Stage::QuestionGeneration,
        Stage::ReportGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentAnalysis => "document_analysis",
            Self::QuestionGeneration => "question_generation",
            Self::ReportGeneration => "report_generation",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DocumentAnalysis => "Document analysis",
            Self::QuestionGeneration => "Question generation",
            Self::ReportGeneration => "Report generation",
        }
    }

    /// Metadata key holding this stage's lock fields
    pub fn lock_key(&self) -> String {
        format!("{}_lock", self.as_str())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "document_analysis" | "documents" | "analysis" => Ok(Self::DocumentAnalysis),
            "question_generation" | "questions" => Ok(Self::QuestionGeneration),
            "report_generation" | "report" => Ok(Self::ReportGeneration),
            _ => Err(format!(
                "Unknown stage: {}. Valid values: documents, questions, report",
                s
            )),
        }
    }
}

/// Lifecycle of one (session, subject, stage) execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown stage status: {}", s)),
        }
    }
}

/// Persisted record of one (session, subject, stage) attempt and its outcome.
///
/// `subject_id` is a document id for document analysis and empty for
/// session-wide stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub session_id: String,
    pub subject_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub recovered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    /// New record in `Processing`, written before the external call starts
    pub fn processing(
        session_id: impl Into<String>,
        subject_id: impl Into<String>,
        stage: Stage,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            subject_id: subject_id.into(),
            stage,
            status: StageStatus::Processing,
            result: None,
            error: None,
            attempts,
            recovered: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

/// Fields a stage record update may change
#[derive(Debug, Clone, Default)]
pub struct StageRecordPatch {
    pub status: Option<StageStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub recovered: Option<bool>,
}

impl StageRecordPatch {
    pub fn completed(result: Value, recovered: bool) -> Self {
        Self {
            status: Some(StageStatus::Completed),
            result: Some(result),
            error: None,
            recovered: Some(recovered),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(StageStatus::Failed),
            result: None,
            error: Some(error.into()),
            recovered: None,
        }
    }
}

/// Outcome of inserting a stage record under its unique key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A concurrent writer already inserted a record for the same key
    Conflict,
}

// =============================================================================
// Intake Artifacts
// =============================================================================

/// Uploaded document text attached to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        session_id: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            filename: filename.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Clarifying question produced by the question-generation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub rationale: String,
}

/// Final multi-part feasibility report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub session_id: String,
    pub sections: Map<String, Value>,
    pub recovered: bool,
    pub cost: CostUsage,
    pub generated_at: DateTime<Utc>,
}

/// Fractional progress of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0.0 - 100.0
    pub percent: f32,
    pub message: String,
}

impl Progress {
    pub fn new(percent: f32, message: impl Into<String>) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        }
    }
}

// =============================================================================
// Cost Accounting
// =============================================================================

/// Token and cost counters of one or more completion calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl CostUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }

    pub fn add(&mut self, other: &CostUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::iter::Sum for CostUsage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(CostUsage::default(), |mut acc, c| {
            acc.add(&c);
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_aliases() {
        assert_eq!("questions".parse::<Stage>().unwrap(), Stage::QuestionGeneration);
        assert_eq!("report".parse::<Stage>().unwrap(), Stage::ReportGeneration);
        assert_eq!(
            "document-analysis".parse::<Stage>().unwrap(),
            Stage::DocumentAnalysis
        );
        assert!("summary".parse::<Stage>().is_err());
    }

    #[test]
    fn test_lock_key_is_per_stage() {
        assert_eq!(Stage::QuestionGeneration.lock_key(), "question_generation_lock");
        assert_ne!(
            Stage::QuestionGeneration.lock_key(),
            Stage::ReportGeneration.lock_key()
        );
    }

    #[test]
    fn test_cost_usage_sum() {
        let total: CostUsage = vec![
            CostUsage::new(100, 50, 0.01),
            CostUsage::new(200, 25, 0.02),
        ]
        .into_iter()
        .sum();
        assert_eq!(total.input_tokens, 300);
        assert_eq!(total.output_tokens, 75);
        assert_eq!(total.total_tokens(), 375);
        assert!((total.cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(Progress::new(140.0, "done").percent, 100.0);
        assert_eq!(Progress::new(-3.0, "start").percent, 0.0);
    }
}
