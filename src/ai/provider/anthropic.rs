//! Anthropic Messages API client
//!
//! One-shot and SSE streaming completions. Streamed usage arrives in two
//! halves: input tokens in `message_start`, output tokens in `message_delta`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::openai::retry_after_header;
use super::sse::{SseParser, read_sse};
use super::stream::{StreamAccumulator, StreamEvent, StreamFinish};
use super::{
    ChunkCallback, CompletionClient, CompletionRequest, CompletionResponse, ResponseMetadata,
    ResponseTiming, TokenUsage, normalize_api_base, pricing_for,
};
use crate::config::LlmConfig;
use crate::constants::network;
use crate::types::{IntakeError, LlmError, Result};

const PROVIDER: &str = "anthropic";
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic client with secure API key handling
pub struct AnthropicClient {
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key_str = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                IntakeError::Config(
                    "Anthropic API key not found. Set ANTHROPIC_API_KEY env var or provide llm.api_key in config"
                        .to_string(),
                )
            })?;

        let api_base =
            normalize_api_base(config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(network::CONNECTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| IntakeError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key: SecretString::from(api_key_str),
            api_base,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": self.temperature,
            "stream": stream,
        });

        if !request.system.is_empty() {
            body["system"] = Value::String(request.system.clone());
        }

        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.api_base);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(&e, PROVIDER))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_header(&response);
            let text = response.text().await.unwrap_or_default();
            let mut err = LlmError::from_status(status, &text, PROVIDER);
            if let Some(wait) = retry_after {
                err = err.retry_after(wait);
            }
            return Err(err.into());
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        info!(provider = PROVIDER, model = %self.model, "Requesting completion");

        let start_time = Instant::now();
        let response = self.send(&self.build_body(request, false)).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::from_reqwest(&e, PROVIDER))?;
        let elapsed = start_time.elapsed();

        let text = body
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<String>()
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                LlmError::transient("No text content in completion response").provider(PROVIDER)
            })?;

        let usage = body
            .get("usage")
            .map(|u| {
                TokenUsage::new(
                    u.get("input_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
                    u.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0),
                )
            })
            .unwrap_or_default();

        debug!(provider = PROVIDER, chars = text.len(), "Received completion");

        Ok(CompletionResponse {
            text,
            cost_usd: pricing_for(PROVIDER, &self.model).cost(&usage),
            usage,
            timing: ResponseTiming::from_duration(elapsed),
            metadata: ResponseMetadata {
                model: self.model.clone(),
                provider: PROVIDER.to_string(),
            },
            finish: StreamFinish::Complete,
        })
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> Result<CompletionResponse> {
        info!(provider = PROVIDER, model = %self.model, "Requesting streamed completion");

        let mut accumulator = StreamAccumulator::new();
        let mut response = self.send(&self.build_body(request, true)).await?;

        let end = read_sse(
            &mut response,
            &mut AnthropicStreamParser,
            deadline,
            &mut accumulator,
            on_chunk,
            PROVIDER,
        )
        .await?;

        accumulator.finish(end, request.prompt_chars(), PROVIDER, &self.model)
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Messages API event payloads
struct AnthropicStreamParser;

impl SseParser for AnthropicStreamParser {
    fn parse(&mut self, data: &str) -> std::result::Result<Vec<StreamEvent>, serde_json::Error> {
        let v: Value = serde_json::from_str(data)?;
        let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

        let events = match event_type {
            "message_start" => v
                .get("message")
                .and_then(|m| m.get("usage"))
                .map(|u| {
                    vec![StreamEvent::Usage {
                        input_tokens: u.get("input_tokens").and_then(|t| t.as_u64()),
                        output_tokens: None,
                    }]
                })
                .unwrap_or_default(),
            "content_block_delta" => v
                .get("delta")
                .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str())
                .map(|text| vec![StreamEvent::Delta(text.to_string())])
                .unwrap_or_default(),
            "message_delta" => v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|t| t.as_u64())
                .map(|output| {
                    vec![StreamEvent::Usage {
                        input_tokens: None,
                        output_tokens: Some(output),
                    }]
                })
                .unwrap_or_default(),
            "message_stop" => vec![StreamEvent::Done],
            "error" => {
                let message = v
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error");
                warn!(provider = PROVIDER, message, "Stream reported an error event");
                Vec::new()
            }
            // ping, content_block_start/stop
            _ => Vec::new(),
        };

        Ok(events)
    }
}
