//! Completion Client Abstraction
//!
//! Defines the `CompletionClient` trait used by every pipeline stage.
//! All clients return `CompletionResponse` with token usage and cost so the
//! orchestrator can account for every billable call.
//!
//! ## Modules
//!
//! - `openai`: OpenAI-compatible chat completions (also DeepSeek via `api_base`)
//! - `anthropic`: Anthropic Messages API
//! - `sse`: shared server-sent-events reader
//! - `stream`: provider-agnostic stream accumulator with terminator synthesis
//! - `pricing`: per-provider price table

mod anthropic;
mod openai;
pub mod pricing;
pub mod sse;
pub mod stream;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub use pricing::{Pricing, pricing_for};
pub use stream::{StreamAccumulator, StreamEvent, StreamFinish};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

use super::retry::AttemptUsage;
use crate::config::LlmConfig;
use crate::types::{CostUsage, IntakeError, Result};

// =============================================================================
// Request
// =============================================================================

/// One completion request: system instructions plus a single user prompt
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// Output token budget; `None` uses the client default
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response where supported
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: String::new(),
            prompt: prompt.into(),
            max_tokens: None,
            json_mode: true,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Characters sent to the model, for usage estimates
    pub fn prompt_chars(&self) -> usize {
        self.system.chars().count() + self.prompt.chars().count()
    }
}

// =============================================================================
// Response with Usage Metrics
// =============================================================================

/// Complete response including text, usage metrics, and cost
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Raw generated text (not yet parsed)
    pub text: String,
    /// Token usage, reported or estimated
    pub usage: TokenUsage,
    /// Cost in USD
    pub cost_usd: f64,
    /// Response timing
    pub timing: ResponseTiming,
    /// Provider and model info
    pub metadata: ResponseMetadata,
    /// How the response ended
    pub finish: StreamFinish,
}

impl CompletionResponse {
    pub fn cost(&self) -> CostUsage {
        CostUsage::new(
            self.usage.input_tokens,
            self.usage.output_tokens,
            self.cost_usd,
        )
    }

    /// Whether usage and cost are estimates rather than provider-reported
    pub fn is_estimated(&self) -> bool {
        self.finish != StreamFinish::Complete
    }
}

impl AttemptUsage for CompletionResponse {
    fn attempt_usage(&self) -> Option<CostUsage> {
        Some(self.cost())
    }
}

/// Token usage metrics for cost tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens (prompt)
    pub input_tokens: u64,
    /// Output tokens (response)
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens used (input + output)
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Response timing metrics
#[derive(Debug, Clone, Default)]
pub struct ResponseTiming {
    /// Total response time in milliseconds (wall clock)
    pub total_ms: u64,
    /// Time to first streamed chunk, when streaming
    pub first_chunk_ms: Option<u64>,
}

impl ResponseTiming {
    pub fn from_duration(duration: std::time::Duration) -> Self {
        Self {
            total_ms: duration.as_millis() as u64,
            first_chunk_ms: None,
        }
    }
}

/// Response metadata
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    /// Model used
    pub model: String,
    /// Provider name
    pub provider: String,
}

// =============================================================================
// Completion Client Trait
// =============================================================================

/// Streaming chunk observer: `(delta, accumulated_text)`
pub type ChunkCallback<'a> = dyn FnMut(&str, &str) + Send + 'a;

/// Long-running text-generation service
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// One-shot completion
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Streaming completion.
    ///
    /// `on_chunk` is invoked for every text delta. When `deadline` passes the
    /// accumulated text is returned with `StreamFinish::Cancelled` (an error
    /// if nothing arrived yet). A stream that closes without its terminal
    /// usage event is completed with estimated usage once enough text has
    /// arrived, otherwise it fails transiently.
    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> Result<CompletionResponse>;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Model name currently in use
    fn model(&self) -> &str;
}

/// Shared client type for concurrent access across pipeline stages.
pub type SharedClient = Arc<dyn CompletionClient>;

/// Create a shared client from configuration
pub fn create_client(config: &LlmConfig) -> Result<SharedClient> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        "deepseek" => Ok(Arc::new(OpenAiClient::deepseek(config)?)),
        "anthropic" => Ok(Arc::new(AnthropicClient::new(config)?)),
        _ => Err(IntakeError::Config(format!(
            "Unknown provider: {}. Supported: openai, deepseek, anthropic",
            config.provider
        ))),
    }
}

/// Validate a configured API base URL and strip its trailing slash
pub(crate) fn normalize_api_base(api_base: &str) -> Result<String> {
    let parsed = url::Url::parse(api_base)
        .map_err(|e| IntakeError::Config(format!("Invalid api_base '{}': {}", api_base, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(IntakeError::Config(format!(
            "Invalid api_base '{}': scheme must be http or https",
            api_base
        )));
    }
    Ok(api_base.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "ollama".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(create_client(&config), Err(IntakeError::Config(_))));
    }

    #[test]
    fn test_create_client_with_key() {
        let config = LlmConfig {
            provider: "anthropic".to_string(),
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        };
        let client = create_client(&config).unwrap();
        assert_eq!(client.name(), "anthropic");
    }

    #[test]
    fn test_normalize_api_base() {
        assert_eq!(
            normalize_api_base("https://api.deepseek.com/v1/").unwrap(),
            "https://api.deepseek.com/v1"
        );
        assert!(normalize_api_base("not a url").is_err());
        assert!(normalize_api_base("ftp://example.com").is_err());
    }

    #[test]
    fn test_response_cost_and_usage() {
        let response = CompletionResponse {
            text: "{}".to_string(),
            usage: TokenUsage::new(100, 50),
            cost_usd: 0.002,
            timing: ResponseTiming::default(),
            metadata: ResponseMetadata::default(),
            finish: StreamFinish::Synthesized,
        };
        assert_eq!(response.cost(), CostUsage::new(100, 50, 0.002));
        assert!(response.is_estimated());
        assert_eq!(response.attempt_usage().unwrap().total_tokens(), 150);
    }
}
