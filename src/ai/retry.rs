//! Retry Policy for completion calls
//!
//! Wraps one externally billed operation with:
//!
//! - **Attempt ceiling**: at most `max_attempts` calls, first call included
//! - **Linear backoff**: attempt N is followed by a `base_delay * N` wait
//! - **Error kinds**: only `ErrorKind::Transient` failures are retried
//! - **Deadlines**: every attempt receives an `Instant` it must finish by; the
//!   guard cuts it off hard after a short grace period
//!
//! Each attempt is logged with its index and latency, and successful attempts
//! also log token and cost counters.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use super::timeout::with_timeout;
use crate::config::RetryConfig;
use crate::constants::retry as retry_constants;
use crate::types::{CostUsage, IntakeError, Result};

/// Per-attempt information handed to the retried operation
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext {
    /// 1-based attempt index
    pub attempt: u32,
    /// Wall-clock time by which the attempt should return
    pub deadline: Instant,
}

/// Values that can report the billable usage of the attempt that produced them
pub trait AttemptUsage {
    fn attempt_usage(&self) -> Option<CostUsage> {
        None
    }
}

impl AttemptUsage for () {}

impl<T: AttemptUsage> AttemptUsage for Vec<T> {
    fn attempt_usage(&self) -> Option<CostUsage> {
        let mut total = CostUsage::default();
        let mut any = false;
        for item in self {
            if let Some(usage) = item.attempt_usage() {
                total.add(&usage);
                any = true;
            }
        }
        any.then_some(total)
    }
}

/// Retry policy with linear backoff and a hard per-attempt deadline
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    attempt_deadline: Duration,
    grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, attempt_deadline: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            attempt_deadline,
            grace: Duration::from_millis(retry_constants::DEADLINE_GRACE_MS),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay(),
            config.attempt_deadline(),
        )
    }

    /// Override the grace period granted past the attempt deadline
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempt_deadline(&self) -> Duration {
        self.attempt_deadline
    }

    /// Wait after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `operation` until it succeeds, fails non-transiently, or the
    /// attempt ceiling is reached.
    ///
    /// Non-transient failures are returned unchanged after the first attempt.
    /// Exhausting the ceiling returns `IntakeError::RetryExhausted` wrapping
    /// the last failure.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        T: AttemptUsage,
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let ctx = AttemptContext {
                attempt,
                deadline: started + self.attempt_deadline,
            };

            let outcome = with_timeout(
                self.attempt_deadline + self.grace,
                operation(ctx),
                label,
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(value) => {
                    match value.attempt_usage() {
                        Some(usage) => info!(
                            operation = label,
                            attempt,
                            latency_ms,
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            cost_usd = usage.cost_usd,
                            "Attempt succeeded"
                        ),
                        None => info!(operation = label, attempt, latency_ms, "Attempt succeeded"),
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            warn!(
                operation = label,
                attempt,
                max_attempts = self.max_attempts,
                latency_ms,
                kind = %err.kind(),
                error = %err,
                "Attempt failed"
            );

            if !err.is_transient() {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                return Err(IntakeError::RetryExhausted {
                    operation: label.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let mut delay = self.backoff(attempt);
            if let IntakeError::Llm(llm) = &err
                && let Some(hint) = llm.retry_after
            {
                delay = delay.max(hint);
            }
            info!(operation = label, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
            sleep(delay).await;
        }
    }
}
