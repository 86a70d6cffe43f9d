//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//!
//! ## Error Kinds
//!
//! The I/O layer tags every upstream failure with one of three kinds, so retry
//! decisions never depend on parsing human-readable messages:
//!
//! - **Transient**: network failure, upstream 5xx/429/408, read timeout (retry)
//! - **Validation**: the request itself was rejected (fail immediately)
//! - **Permanent**: auth/not-found/unsupported (fail immediately)

use std::time::Duration;
use thiserror::Error;

use super::session::Stage;

// =============================================================================
// Error Kinds
// =============================================================================

/// Closed set of failure kinds produced by the I/O layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Temporary failure - retrying may succeed
    Transient,
    /// Request rejected as malformed - retrying cannot change the outcome
    Validation,
    /// Non-recoverable upstream condition (auth, missing model, ...)
    Permanent,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Permanent => write!(f, "PERMANENT"),
        }
    }
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Classify an HTTP status returned by a completion endpoint
    pub fn from_http_status(status: u16) -> Self {
        match status {
            408 | 409 | 425 | 429 | 500..=599 => Self::Transient,
            400 | 413 | 422 => Self::Validation,
            _ => Self::Permanent,
        }
    }
}

// =============================================================================
// LLM Error
// =============================================================================

/// Upstream completion error with kind, context, and retry hints
#[derive(Debug, Clone)]
pub struct LlmError {
    /// Error kind for routing decisions
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// Provider that produced the error
    pub provider: Option<String>,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Suggested wait time before retry (from `retry-after`)
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.provider, self.status) {
            (Some(provider), Some(status)) => {
                write!(f, "[{}:{}:{}] {}", provider, self.kind, status, self.message)
            }
            (Some(provider), None) => write!(f, "[{}:{}] {}", provider, self.kind, self.message),
            (None, _) => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

impl LlmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            status: None,
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Build from an HTTP error response
    pub fn from_status(status: u16, body: &str, provider: impl Into<String>) -> Self {
        let preview: String = body.chars().take(300).collect();
        Self {
            kind: ErrorKind::from_http_status(status),
            message: preview,
            provider: Some(provider.into()),
            status: Some(status),
            retry_after: None,
        }
    }

    /// Build from a transport-level reqwest failure using its flags
    pub fn from_reqwest(err: &reqwest::Error, provider: impl Into<String>) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            ErrorKind::Transient
        } else if let Some(status) = err.status() {
            ErrorKind::from_http_status(status.as_u16())
        } else if err.is_builder() {
            ErrorKind::Validation
        } else {
            ErrorKind::Transient
        };
        Self {
            kind,
            message: err.to_string(),
            provider: Some(provider.into()),
            status: err.status().map(|s| s.as_u16()),
            retry_after: None,
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum IntakeError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Upstream Errors
    // -------------------------------------------------------------------------
    #[error("LLM error: {0}")]
    Llm(LlmError),

    /// A single attempt exceeded its wall-clock deadline
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Every retry attempt failed
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<IntakeError>,
    },

    // -------------------------------------------------------------------------
    // Stage Errors
    // -------------------------------------------------------------------------
    #[error("{stage} is already in progress for session {session_id}")]
    AlreadyInProgress { session_id: String, stage: Stage },

    #[error("{stage} failed {attempts} times for session {session_id}")]
    RetryLimitExceeded {
        session_id: String,
        stage: Stage,
        attempts: u32,
    },

    /// The stage lock or attempt record was taken over while this attempt ran
    #[error("{stage} for session {session_id} was taken over by another run")]
    LeaseLost { session_id: String, stage: Stage },

    /// Another caller's attempt at the stage failed while this one waited
    #[error("{stage} failed: {reason}")]
    StageFailed { stage: Stage, reason: String },

    #[error("{stage} cannot start: {reason}")]
    PrerequisiteMissing { stage: Stage, reason: String },

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not initialized: run 'intakeflow init' first")]
    NotInitialized,
}

impl From<LlmError> for IntakeError {
    fn from(err: LlmError) -> Self {
        IntakeError::Llm(err)
    }
}

impl From<r2d2::Error> for IntakeError {
    fn from(err: r2d2::Error) -> Self {
        IntakeError::Storage(format!("Connection pool error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl IntakeError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Failure kind used by the retry policy.
    ///
    /// Only upstream failures and deadlines are transient; storage, config and
    /// stage-state errors never benefit from another billable call.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Llm(e) => e.kind,
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::RetryExhausted { last, .. } => last.kind(),
            Self::Config(_) => ErrorKind::Validation,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Message shown to end users, always ending with an actionable next step
    pub fn user_message(&self) -> String {
        match self {
            Self::RetryExhausted { .. } | Self::Timeout { .. } => {
                "The analysis service is temporarily unavailable. Please retry in a few minutes."
                    .to_string()
            }
            Self::Llm(e) => match e.kind {
                ErrorKind::Transient => {
                    "The analysis service is temporarily unavailable. Please retry in a few minutes."
                        .to_string()
                }
                ErrorKind::Validation => format!(
                    "The analysis request was rejected ({}). Shorten or simplify the uploaded documents and try again.",
                    e.message
                ),
                ErrorKind::Permanent => format!(
                    "The analysis provider refused the request ({}). Check the provider configuration and API key, then retry.",
                    e.message
                ),
            },
            Self::AlreadyInProgress { stage, .. } => format!(
                "{} is already running for this session. Wait for it to finish, then check progress.",
                stage
            ),
            Self::RetryLimitExceeded {
                stage, attempts, ..
            } => format!(
                "{} failed {} times and will not be retried automatically. Review the uploaded documents, then reset the stage and retry.",
                stage, attempts
            ),
            Self::LeaseLost { stage, .. } => format!(
                "{} was taken over by another run. Check progress before retrying.",
                stage
            ),
            Self::StageFailed { stage, .. } => format!(
                "{} failed in a concurrent run. Check progress, then retry the stage.",
                stage
            ),
            Self::PrerequisiteMissing { reason, .. } => {
                format!("{}. Complete the earlier stage first, then retry.", reason)
            }
            Self::NotFound(what) => format!("{} was not found. Check the identifier and retry.", what),
            Self::NotInitialized => "Run 'intakeflow init' first.".to_string(),
            other => format!("{}. Please retry; if it persists, check the logs.", other),
        }
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| IntakeError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| IntakeError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Transient.to_string(), "TRANSIENT");
        assert_eq!(ErrorKind::Validation.to_string(), "VALIDATION");
        assert_eq!(ErrorKind::Permanent.to_string(), "PERMANENT");
    }

    #[test]
    fn test_classify_http_status() {
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(503), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(504), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(408), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(400), ErrorKind::Validation);
        assert_eq!(ErrorKind::from_http_status(422), ErrorKind::Validation);
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::Permanent);
        assert_eq!(ErrorKind::from_http_status(404), ErrorKind::Permanent);
    }

    #[test]
    fn test_error_kind_propagation() {
        let err: IntakeError = LlmError::transient("socket closed").into();
        assert!(err.is_transient());

        let err = IntakeError::timeout("completion", Duration::from_secs(320));
        assert!(err.is_transient());

        let err: IntakeError = LlmError::validation("max_tokens too large").into();
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = IntakeError::Storage("disk full".to_string());
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_llm_error_display() {
        let err = LlmError::from_status(503, "overloaded", "openai");
        assert_eq!(err.to_string(), "[openai:TRANSIENT:503] overloaded");

        let err = LlmError::new(ErrorKind::Permanent, "bad key");
        assert_eq!(err.to_string(), "[PERMANENT] bad key");
    }

    #[test]
    fn test_user_messages_are_actionable() {
        let errors = vec![
            IntakeError::RetryExhausted {
                operation: "questions".to_string(),
                attempts: 2,
                last: Box::new(LlmError::transient("reset").into()),
            },
            IntakeError::AlreadyInProgress {
                session_id: "s".to_string(),
                stage: Stage::QuestionGeneration,
            },
            IntakeError::RetryLimitExceeded {
                session_id: "s".to_string(),
                stage: Stage::ReportGeneration,
                attempts: 3,
            },
            LlmError::validation("too long").into(),
        ];

        for err in errors {
            let msg = err.user_message().to_lowercase();
            assert!(
                msg.contains("retry") || msg.contains("wait") || msg.contains("shorten"),
                "not actionable: {}",
                msg
            );
        }
    }
}
