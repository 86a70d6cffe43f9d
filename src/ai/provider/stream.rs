//! Provider-agnostic stream accumulation
//!
//! Provider parsers turn SSE payloads into [`StreamEvent`]s; the
//! [`StreamAccumulator`] collects them and decides how the stream ended:
//!
//! - terminal event seen: reported usage, [`StreamFinish::Complete`]
//! - closed early with enough text: usage estimated from character counts,
//!   cost from the pricing table, [`StreamFinish::Synthesized`]
//! - deadline reached with partial text: estimated usage,
//!   [`StreamFinish::Cancelled`]
//!
//! Anything else is a transient failure for the retry policy to handle.

use tokio::time::Instant;
use tracing::{debug, warn};

use super::pricing::pricing_for;
use super::{ChunkCallback, CompletionResponse, ResponseMetadata, ResponseTiming, TokenUsage};
use crate::constants::{pricing::CHARS_PER_TOKEN, stream::MIN_SYNTHESIS_CHARS};
use crate::types::{IntakeError, LlmError, Result};

/// Normalized streaming event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text
    Delta(String),
    /// Usage counters; either side may be reported separately
    Usage {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// Terminal event
    Done,
}

/// How a completion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFinish {
    /// Provider sent its terminal event (or a one-shot call returned)
    Complete,
    /// Channel closed early; terminal record synthesized from the text
    Synthesized,
    /// Attempt deadline reached; partial text kept
    Cancelled,
}

/// Why the reader stopped pulling from the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Closed,
    DeadlineReached,
}

/// Collects streamed text and usage for one completion
#[derive(Debug)]
pub struct StreamAccumulator {
    text: String,
    chars: usize,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    done: bool,
    started: Instant,
    first_chunk_ms: Option<u64>,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            chars: 0,
            input_tokens: None,
            output_tokens: None,
            done: false,
            started: Instant::now(),
            first_chunk_ms: None,
        }
    }

    /// Apply one event, forwarding text deltas to `on_chunk`
    pub fn apply(&mut self, event: StreamEvent, on_chunk: &mut ChunkCallback<'_>) {
        match event {
            StreamEvent::Delta(delta) => {
                if delta.is_empty() {
                    return;
                }
                if self.first_chunk_ms.is_none() {
                    self.first_chunk_ms = Some(self.started.elapsed().as_millis() as u64);
                }
                self.chars += delta.chars().count();
                self.text.push_str(&delta);
                on_chunk(&delta, &self.text);
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                if input_tokens.is_some() {
                    self.input_tokens = input_tokens;
                }
                if output_tokens.is_some() {
                    self.output_tokens = output_tokens;
                }
            }
            StreamEvent::Done => self.done = true,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn char_count(&self) -> usize {
        self.chars
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Build the final response.
    ///
    /// `prompt_chars` feeds the input-token estimate when the provider never
    /// reported one.
    pub fn finish(
        self,
        end: StreamEnd,
        prompt_chars: usize,
        provider: &str,
        model: &str,
    ) -> Result<CompletionResponse> {
        let finish = if self.done {
            StreamFinish::Complete
        } else {
            match end {
                StreamEnd::DeadlineReached if self.chars > 0 => StreamFinish::Cancelled,
                StreamEnd::DeadlineReached => {
                    return Err(IntakeError::timeout(
                        format!("{} stream produced no text", provider),
                        self.started.elapsed(),
                    ));
                }
                StreamEnd::Closed if self.chars >= MIN_SYNTHESIS_CHARS => StreamFinish::Synthesized,
                StreamEnd::Closed => {
                    return Err(LlmError::transient(format!(
                        "stream closed after {} chars without a completion event",
                        self.chars
                    ))
                    .provider(provider)
                    .into());
                }
            }
        };

        let usage = TokenUsage::new(
            self.input_tokens
                .unwrap_or_else(|| (prompt_chars as u64).div_ceil(CHARS_PER_TOKEN)),
            self.output_tokens
                .unwrap_or_else(|| (self.chars as u64).div_ceil(CHARS_PER_TOKEN)),
        );
        let cost_usd = pricing_for(provider, model).cost(&usage);

        match finish {
            StreamFinish::Complete => debug!(provider, chars = self.chars, "Stream completed"),
            StreamFinish::Synthesized => warn!(
                provider,
                chars = self.chars,
                estimated_output_tokens = usage.output_tokens,
                "Stream closed without completion event, usage synthesized"
            ),
            StreamFinish::Cancelled => warn!(
                provider,
                chars = self.chars,
                "Attempt deadline reached, keeping partial output"
            ),
        }

        Ok(CompletionResponse {
            text: self.text,
            usage,
            cost_usd,
            timing: ResponseTiming {
                total_ms: self.started.elapsed().as_millis() as u64,
                first_chunk_ms: self.first_chunk_ms,
            },
            metadata: ResponseMetadata {
                model: model.to_string(),
                provider: provider.to_string(),
            },
            finish,
        })
    }
}
