//! Bounded retry for storage operations.

use std::future::Future;
use std::time::Duration;

use imgflow_core::error::CoreError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the n-th failed attempt is `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-I/O error, or the attempts
/// run out. Only [`CoreError::Io`] is retried.
pub async fn with_io_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_io() && attempt < policy.attempts => {
                tracing::warn!(attempt, error = %e, "Storage operation failed, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
