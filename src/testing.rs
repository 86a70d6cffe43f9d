//! Test doubles shared across module tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::ai::provider::stream::{StreamAccumulator, StreamEnd, StreamEvent};
use crate::ai::{
    ChunkCallback, CompletionClient, CompletionRequest, CompletionResponse, ResponseMetadata,
    ResponseTiming, StreamFinish, TokenUsage,
};
use crate::types::{LlmError, Result, estimate_tokens};

/// Cost reported for every successful scripted call
pub const CALL_COST_USD: f64 = 0.01;

/// One scripted reply
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Complete response with a terminal event
    Reply(String),
    /// Stream closes before its terminal event
    Truncated(String),
    /// Transient upstream failure
    Unavailable,
    /// Upstream rejects the request
    Rejected,
    /// Never answers
    Hang,
}

/// Fake completion client.
///
/// Each call takes the next scripted step; once the script is empty the
/// first route whose needle appears in the prompt answers, then the fallback.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    routes: Vec<(String, String)>,
    fallback: Option<String>,
    delay: Duration,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            routes: Vec::new(),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `text`
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(Vec::new()).with_fallback(text)
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    /// Answer prompts containing `needle` with `text`
    pub fn with_route(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.routes.push((needle.into(), text.into()));
        self
    }

    /// Queue a step for the next call
    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Simulated latency of every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    async fn next(&self, request: &CompletionRequest) -> Scripted {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let step = self.script.lock().unwrap().pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(step) = step {
            return step;
        }
        self.routes
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle.as_str()))
            .map(|(_, text)| text.clone())
            .or_else(|| self.fallback.clone())
            .map(Scripted::Reply)
            .unwrap_or(Scripted::Unavailable)
    }

    fn response(&self, request: &CompletionRequest, text: String) -> CompletionResponse {
        CompletionResponse {
            usage: TokenUsage::new(
                estimate_tokens(&request.prompt),
                estimate_tokens(&text),
            ),
            text,
            cost_usd: CALL_COST_USD,
            timing: ResponseTiming::default(),
            metadata: ResponseMetadata {
                model: "scripted".to_string(),
                provider: "scripted".to_string(),
            },
            finish: StreamFinish::Complete,
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        match self.next(request).await {
            Scripted::Reply(text) | Scripted::Truncated(text) => Ok(self.response(request, text)),
            Scripted::Unavailable => Err(LlmError::transient("service unavailable").into()),
            Scripted::Rejected => Err(LlmError::validation("context length exceeded").into()),
            Scripted::Hang => std::future::pending().await,
        }
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
        on_chunk: &mut ChunkCallback<'_>,
    ) -> Result<CompletionResponse> {
        let (text, terminated) = match self.next(request).await {
            Scripted::Reply(text) => (text, true),
            Scripted::Truncated(text) => (text, false),
            Scripted::Unavailable => return Err(LlmError::transient("service unavailable").into()),
            Scripted::Rejected => {
                return Err(LlmError::validation("context length exceeded").into());
            }
            Scripted::Hang => {
                tokio::time::sleep_until(deadline).await;
                (String::new(), false)
            }
        };

        let mut acc = StreamAccumulator::new();
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(64) {
            acc.apply(StreamEvent::Delta(piece.iter().collect()), on_chunk);
        }
        if terminated {
            acc.apply(
                StreamEvent::Usage {
                    input_tokens: Some(estimate_tokens(&request.prompt)),
                    output_tokens: Some(estimate_tokens(&text)),
                },
                on_chunk,
            );
            acc.apply(StreamEvent::Done, on_chunk);
            let mut response = acc.finish(StreamEnd::Closed, request.prompt_chars(), "scripted", "scripted")?;
            response.cost_usd = CALL_COST_USD;
            return Ok(response);
        }

        let end = if Instant::now() >= deadline {
            StreamEnd::DeadlineReached
        } else {
            StreamEnd::Closed
        };
        acc.finish(end, request.prompt_chars(), "scripted", "scripted")
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
