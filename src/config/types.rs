//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/intakeflow/) and project (.intakeflow/) level configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{lock, network, pipeline, retry};
use crate::types::{IntakeError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// LLM provider settings
    pub llm: LlmConfig,

    /// Retry policy for completion calls
    pub retry: RetryConfig,

    /// Stage orchestration settings
    pub pipeline: PipelineConfig,

    /// Session store settings
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `IntakeError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(IntakeError::Config(format!(
                "LLM temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }

        if self.llm.timeout_secs == 0 {
            return Err(IntakeError::Config(
                "LLM timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.llm.max_tokens == 0 {
            return Err(IntakeError::Config(
                "LLM max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(IntakeError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.attempt_deadline_secs == 0 {
            return Err(IntakeError::Config(
                "retry.attempt_deadline_secs must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.stage_attempt_ceiling == 0 {
            return Err(IntakeError::Config(
                "pipeline.stage_attempt_ceiling must be at least 1".to_string(),
            ));
        }

        if self.pipeline.document_concurrency == 0 {
            return Err(IntakeError::Config(
                "pipeline.document_concurrency must be at least 1".to_string(),
            ));
        }

        // Leases are renewed before every attempt, so the TTL must outlast
        // one attempt plus the longest backoff in front of the next
        let renewal_gap_ms = self.retry.longest_attempt_gap_ms();
        if self.pipeline.lock_ttl_secs.saturating_mul(1000) <= renewal_gap_ms {
            return Err(IntakeError::Config(format!(
                "pipeline.lock_ttl_secs ({}) must exceed the longest gap between lease renewals ({} ms)",
                self.pipeline.lock_ttl_secs, renewal_gap_ms
            )));
        }

        Ok(())
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

/// Provider settings.
///
/// API keys are never serialized and are redacted in debug output.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider type: "openai", "deepseek", "anthropic"
    pub provider: String,

    /// Model name (provider default when unset)
    pub model: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Temperature for generation
    pub temperature: f32,

    /// Maximum output tokens for single-shot calls
    pub max_tokens: u32,

    /// API key (falls back to the provider's env var)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            temperature: 0.2,
            max_tokens: 4096,
            api_key: None,
            api_base: None,
        }
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per completion call (including the first)
    pub max_attempts: u32,

    /// Linear backoff unit in milliseconds
    pub base_delay_ms: u64,

    /// Hard deadline of a single attempt in seconds
    pub attempt_deadline_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: retry::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: retry::BASE_DELAY_MS,
            attempt_deadline_secs: retry::ATTEMPT_DEADLINE_SECS,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn attempt_deadline(&self) -> Duration {
        Duration::from_secs(self.attempt_deadline_secs)
    }

    /// Worst case between two attempt starts: a full attempt with its grace
    /// period, then the largest linear backoff
    pub fn longest_attempt_gap_ms(&self) -> u64 {
        let largest_backoff = self
            .base_delay_ms
            .saturating_mul(u64::from(self.max_attempts.saturating_sub(1)));
        self.attempt_deadline_secs
            .saturating_mul(1000)
            .saturating_add(retry::DEADLINE_GRACE_MS)
            .saturating_add(largest_backoff)
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage lock time-to-live in seconds
    pub lock_ttl_secs: u64,

    /// Failed attempts before a stage is permanently failed
    pub stage_attempt_ceiling: u32,

    /// Concurrent document analyses per session
    pub document_concurrency: usize,

    /// How long a caller that lost the lock race waits for the winner's result
    pub in_progress_wait_secs: u64,

    /// Poll interval while waiting, in milliseconds
    pub poll_interval_ms: u64,

    /// Output budget for each report phase
    pub report_phase_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: lock::DEFAULT_TTL_SECS,
            stage_attempt_ceiling: pipeline::STAGE_ATTEMPT_CEILING,
            document_concurrency: pipeline::DOCUMENT_CONCURRENCY,
            in_progress_wait_secs: pipeline::IN_PROGRESS_WAIT_SECS,
            poll_interval_ms: pipeline::POLL_INTERVAL_MS,
            report_phase_max_tokens: pipeline::REPORT_PHASE_MAX_TOKENS,
        }
    }
}

impl PipelineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn in_progress_wait(&self) -> Duration {
        Duration::from_secs(self.in_progress_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".intakeflow/intake.db"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.attempt_deadline_secs, 320);
        assert_eq!(config.pipeline.lock_ttl(), Duration::from_secs(600));
        assert_eq!(config.pipeline.stage_attempt_ceiling, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.llm.temperature = 3.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.document_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_ttl_must_outlast_one_attempt() {
        let config = Config::default();
        // 320 s deadline + 2 s grace + 2 s backoff
        assert_eq!(config.retry.longest_attempt_gap_ms(), 324_000);

        let mut config = Config::default();
        config.pipeline.lock_ttl_secs = 324;
        assert!(config.validate().is_err());

        config.pipeline.lock_ttl_secs = 0;
        assert!(config.validate().is_err());

        config.pipeline.lock_ttl_secs = 325;
        assert!(config.validate().is_ok());

        config.retry.attempt_deadline_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_redacted_and_not_serialized() {
        let config = LlmConfig {
            api_key: Some("sk-secret".to_string()),
            ..LlmConfig::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));

        let serialized = serde_json::to_string(&config).unwrap();
        assert!(!serialized.contains("sk-secret"));
    }
}
