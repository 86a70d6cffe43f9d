//! Deadline helpers
//!
//! Completion attempts run against a wall-clock deadline rather than a bare
//! duration, so streaming consumers can check how much time is left and stop
//! early with partial output while the outer guard still enforces a hard cut.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::ai::timeout::with_timeout;
//!
//! let result = with_timeout(
//!     Duration::from_secs(320),
//!     async { /* completion call */ },
//!     "question generation"
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{IntakeError, Result};

/// Execute an async operation with a timeout
///
/// Returns `IntakeError::Timeout` if the operation doesn't complete within the
/// specified duration. The timeout is classified as transient by the retry policy.
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(IntakeError::timeout(operation_name, timeout)),
    }
}

/// Time left until `deadline`, zero once it has passed
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Whether `deadline` has passed
pub fn expired(deadline: Instant) -> bool {
    Instant::now() >= deadline
}
