//! Bounded retry of transient storage contention.
//!
//! A single-writer replicated log surfaces write contention as "database is
//! locked". Only that condition is retried, with a fixed number of attempts
//! and a fixed delay. Every other error is returned on first occurrence.

use crate::core::error::KvsqlResult;
use std::time::Duration;

/// Retry policy for locked failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retriable error, or the
/// policy's attempts are exhausted. The last error is returned.
pub async fn with_retry<T, F>(policy: &RetryPolicy, mut op: F) -> KvsqlResult<T>
where
    F: FnMut() -> KvsqlResult<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_retriable() && attempt < policy.attempts => {
                tracing::debug!(attempt, error = %e, "storage locked, retrying");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            result => return result,
        }
    }
}
