use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::AdapterError;

/// Bounded exponential backoff applied to transient backend failures.
///
/// Non-transient errors (validation, not-found, duplicates, schema
/// mismatch) propagate on the first attempt. All retried operations
/// converge to the same durable value, so at-least-once re-execution is
/// safe here.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(100) }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt `attempt` (1-based),
    /// exponential with up to 50% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.5));
        base + jitter
    }
}

/// Run `operation` under `policy`, retrying while it fails with a
/// transient error and attempts remain.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
