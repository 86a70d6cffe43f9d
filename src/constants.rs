//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! Retry counts, TTLs and delays below are empirically chosen defaults; every
//! one of them can be overridden through configuration.

/// Retry policy constants
pub mod retry {
    /// Attempts per single-shot completion call
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

    /// Base delay for linear backoff (milliseconds); attempt N waits N * base
    pub const BASE_DELAY_MS: u64 = 2_000;

    /// Hard wall-clock deadline for one attempt (seconds)
    pub const ATTEMPT_DEADLINE_SECS: u64 = 320;

    /// Extra time granted past the attempt deadline before the hard cut, so a
    /// streaming reader can hand back partial output first (milliseconds)
    pub const DEADLINE_GRACE_MS: u64 = 2_000;
}

/// Stage lock constants
pub mod lock {
    /// Lock time-to-live (seconds); exceeds the slowest call plus one retry
    pub const DEFAULT_TTL_SECS: u64 = 600;
}

/// Pipeline constants
pub mod pipeline {
    /// Failed attempts after which a stage is permanently failed
    pub const STAGE_ATTEMPT_CEILING: u32 = 3;

    /// Concurrent document analyses per session
    pub const DOCUMENT_CONCURRENCY: usize = 4;

    /// How long a lock loser waits for the winner's result (seconds)
    pub const IN_PROGRESS_WAIT_SECS: u64 = 30;

    /// Poll interval while waiting for a concurrent producer (milliseconds)
    pub const POLL_INTERVAL_MS: u64 = 500;

    /// Output budget for each report phase
    pub const REPORT_PHASE_MAX_TOKENS: u32 = 4096;

    /// Maximum characters of one document sent to the model
    pub const MAX_DOCUMENT_CHARS: usize = 60_000;
}

/// Streaming constants
pub mod stream {
    /// Minimum accumulated characters to synthesize a missing terminal event
    pub const MIN_SYNTHESIS_CHARS: usize = 100;
}

/// Pricing constants
pub mod pricing {
    /// Characters per token used for estimates
    pub const CHARS_PER_TOKEN: u64 = 4;
}

/// HTTP/Network constants
pub mod network {
    /// Default request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 320;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;
}
