//! OpenAI-compatible Chat Completions client
//!
//! Serves OpenAI and DeepSeek (same wire format, different base URL).
//! One-shot and SSE streaming calls both return usage and cost.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::sse::{SseParser, read_sse};
use super::stream::{StreamAccumulator, StreamEvent, StreamFinish};
use super::{
    ChunkCallback, CompletionClient, CompletionRequest, CompletionResponse, ResponseMetadata,
    ResponseTiming, TokenUsage, normalize_api_base, pricing_for,
};
use crate::config::LlmConfig;
use crate::constants::network;
use crate::types::{IntakeError, LlmError, Result};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENAI_MODEL: &str = "gpt-4o";
const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com/v1";
const DEEPSEEK_MODEL: &str = "deepseek-chat";

/// OpenAI-compatible client with secure API key handling
pub struct OpenAiClient {
    /// Provider label used for pricing and logs ("openai" or "deepseek")
    provider: &'static str,
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("provider", &self.provider)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Self::build(config, "openai", "OPENAI_API_KEY", OPENAI_API_BASE, OPENAI_MODEL)
    }

    pub fn deepseek(config: &LlmConfig) -> Result<Self> {
        Self::build(
            config,
            "deepseek",
            "DEEPSEEK_API_KEY",
            DEEPSEEK_API_BASE,
            DEEPSEEK_MODEL,
        )
    }

    fn build(
        config: &LlmConfig,
        provider: &'static str,
        key_var: &str,
        default_base: &str,
        default_model: &str,
    ) -> Result<Self> {
        let api_key_str = config
            .api_key
            .clone()
            .or_else(|| std::env::var(key_var).ok())
            .ok_or_else(|| {
                IntakeError::Config(format!(
                    "{} API key not found. Set {} env var or provide llm.api_key in config",
                    provider, key_var
                ))
            })?;

        let api_base = normalize_api_base(config.api_base.as_deref().unwrap_or(default_base))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string());

        // The per-attempt deadline is enforced by the retry policy; this is a backstop.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(network::CONNECTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| IntakeError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            api_key: SecretString::from(api_key_str),
            api_base,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
            response_format: request.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_base);

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(&e, self.provider))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            let mut err = LlmError::from_status(status, &body, self.provider);
            if let Some(wait) = retry_after {
                err = err.retry_after(wait);
            }
            return Err(err.into());
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        info!(
            provider = self.provider,
            model = %self.model,
            "Requesting completion"
        );

        let start_time = Instant::now();
        let body = self.build_request(request, false);
        let response = self.send(&body).await?;

        let response_body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::from_reqwest(&e, self.provider))?;
        let elapsed = start_time.elapsed();

        let usage = response_body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let text = response_body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                LlmError::transient("No content in completion response").provider(self.provider)
            })?;

        debug!(provider = self.provider, chars = text.len(), "Received completion");

        Ok(CompletionResponse {
            text,
            cost_usd: pricing_for(self.provider, &self.model).cost(&usage),
            usage,
            timing: ResponseTiming::from_duration(elapsed),
            metadata: ResponseMetadata {
                model: self.model.clone(),
                provider: self.provider.to_string(),
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
        info!(
            provider = self.provider,
            model = %self.model,
            "Requesting streamed completion"
        );

        let body = self.build_request(request, true);
        let mut accumulator = StreamAccumulator::new();
        let mut response = self.send(&body).await?;

        let end = read_sse(
            &mut response,
            &mut OpenAiStreamParser,
            deadline,
            &mut accumulator,
            on_chunk,
            self.provider,
        )
        .await?;

        accumulator.finish(end, request.prompt_chars(), self.provider, &self.model)
    }

    fn name(&self) -> &str {
        self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Parse the `retry-after` header (seconds form)
pub(super) fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// `chat.completion.chunk` payloads
pub(super) struct OpenAiStreamParser;

impl SseParser for OpenAiStreamParser {
    fn parse(&mut self, data: &str) -> std::result::Result<Vec<StreamEvent>, serde_json::Error> {
        if data.trim() == "[DONE]" {
            return Ok(vec![StreamEvent::Done]);
        }

        let v: Value = serde_json::from_str(data)?;
        let mut events = Vec::new();

        if let Some(content) = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(|c| c.as_str())
        {
            events.push(StreamEvent::Delta(content.to_string()));
        }

        // Usage-only chunk (stream_options.include_usage)
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            events.push(StreamEvent::Usage {
                input_tokens: usage.get("prompt_tokens").and_then(|t| t.as_u64()),
                output_tokens: usage.get("completion_tokens").and_then(|t| t.as_u64()),
            });
        }

        Ok(events)
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAiClient {
        OpenAiClient::new(&LlmConfig {
            api_key: Some("sk-test".to_string()),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", client());
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_deepseek_defaults() {
        let client = OpenAiClient::deepseek(&LlmConfig {
            provider: "deepseek".to_string(),
            api_key: Some("k".to_string()),
            ..LlmConfig::default()
        })
        .unwrap();
        assert_eq!(client.name(), "deepseek");
        assert_eq!(client.model(), "deepseek-chat");
        assert_eq!(client.api_base, "https://api.deepseek.com/v1");
    }

    #[test]
    fn test_stream_request_asks_for_usage() {
        let request = CompletionRequest::new("analyze")
            .with_system("json only")
            .with_max_tokens(512);
        let body = serde_json::to_value(client().build_request(&request, true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "system");

        let body = serde_json::to_value(client().build_request(&request, false)).unwrap();
        assert!(body.get("stream").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_stream_parser() {
        let mut parser = OpenAiStreamParser;
        assert_eq!(
            parser
                .parse(r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#)
                .unwrap(),
            vec![StreamEvent::Delta("Hi".to_string())]
        );
        assert_eq!(
            parser
                .parse(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#)
                .unwrap(),
            vec![StreamEvent::Usage {
                input_tokens: Some(12),
                output_tokens: Some(3)
            }]
        );
        assert!(
            parser
                .parse(r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":null}"#)
                .unwrap()
                .is_empty()
        );
        assert_eq!(parser.parse("[DONE]").unwrap(), vec![StreamEvent::Done]);
        assert!(parser.parse("{broken").is_err());
    }
}
