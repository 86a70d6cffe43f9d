//! Shared SSE reader for streaming clients.
//!
//! Every provider streams the same way: buffer response chunks, split on
//! `\n\n`, pull out `data:` payloads and hand each one to a provider-specific
//! [`SseParser`]. The reader also enforces the attempt deadline between chunks.

use tokio::time::Instant;
use tracing::{debug, warn};

use super::stream::{StreamAccumulator, StreamEnd, StreamEvent};
use super::ChunkCallback;
use crate::ai::timeout::remaining;
use crate::types::{LlmError, Result};

/// Provider-specific translation of one `data:` payload
pub trait SseParser: Send {
    /// Events carried by `data`; malformed payloads return an error and are skipped
    fn parse(&mut self, data: &str) -> std::result::Result<Vec<StreamEvent>, serde_json::Error>;
}

/// Extract complete `data:` payloads from an SSE buffer.
///
/// The buffer is drained in place; a trailing partial event stays for the
/// next call.
pub fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Append the UTF-8 text in `bytes` to `buffer`.
///
/// A multi-byte character split across network chunks stays in `pending`
/// until the rest of it arrives; invalid sequences become U+FFFD.
pub fn push_utf8(pending: &mut Vec<u8>, bytes: &[u8], buffer: &mut String) {
    pending.extend_from_slice(bytes);

    loop {
        let err = match std::str::from_utf8(pending) {
            Ok(text) => {
                buffer.push_str(text);
                pending.clear();
                return;
            }
            Err(err) => err,
        };

        let valid = err.valid_up_to();
        buffer.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match err.error_len() {
            // Incomplete trailing sequence: wait for the next chunk
            None => {
                pending.drain(..valid);
                return;
            }
            Some(len) => {
                buffer.push(char::REPLACEMENT_CHARACTER);
                pending.drain(..valid + len);
            }
        }
    }
}

/// Parse every complete event in `buffer` into `acc`
pub fn feed_buffer<P: SseParser + ?Sized>(
    buffer: &mut String,
    parser: &mut P,
    acc: &mut StreamAccumulator,
    on_chunk: &mut ChunkCallback<'_>,
) {
    // Some servers emit CRLF line endings
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    for data in drain_data_lines(buffer) {
        match parser.parse(&data) {
            Ok(events) => {
                for event in events {
                    acc.apply(event, on_chunk);
                }
            }
            Err(e) => debug!(error = %e, "Skipping malformed SSE payload"),
        }
    }
}

/// Read `response` until the terminal event, channel close, or `deadline`.
///
/// Transport errors after some text has arrived end the stream like a close,
/// leaving the terminator decision to the accumulator.
pub async fn read_sse<P: SseParser + ?Sized>(
    response: &mut reqwest::Response,
    parser: &mut P,
    deadline: Instant,
    acc: &mut StreamAccumulator,
    on_chunk: &mut ChunkCallback<'_>,
    provider: &str,
) -> Result<StreamEnd> {
    let mut buffer = String::new();
    let mut pending = Vec::new();

    loop {
        if acc.is_done() {
            return Ok(StreamEnd::Closed);
        }

        let next = tokio::time::timeout(remaining(deadline), response.chunk()).await;
        match next {
            Err(_) => return Ok(StreamEnd::DeadlineReached),
            Ok(Ok(Some(bytes))) => {
                push_utf8(&mut pending, &bytes, &mut buffer);
                feed_buffer(&mut buffer, parser, acc, on_chunk);
            }
            Ok(Ok(None)) => {
                if !pending.is_empty() {
                    buffer.push_str(&String::from_utf8_lossy(&pending));
                }
                if !buffer.trim().is_empty() {
                    buffer.push_str("\n\n");
                    feed_buffer(&mut buffer, parser, acc, on_chunk);
                }
                return Ok(StreamEnd::Closed);
            }
            Ok(Err(e)) => {
                if acc.char_count() == 0 {
                    return Err(LlmError::from_reqwest(&e, provider).into());
                }
                warn!(provider, error = %e, chars = acc.char_count(), "Stream interrupted");
                return Ok(StreamEnd::Closed);
            }
        }
    }
}
