//! Bounded exponential backoff for transport-level failures.
//!
//! Rate-limit and timeout errors are retried up to the configured bound
//! with jittered exponential delays; everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use od_domain::Result;

/// Retry policy: `max_retries` additional attempts after the first,
/// delays of `base * 2^attempt` seconds with 80–120% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_seconds: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_seconds: f64) -> Self {
        Self {
            max_retries,
            base_seconds,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base_seconds * 2f64.powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64((raw * jitter).min(120.0))
    }
}

/// Run `op`, retrying retryable errors per the policy.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transport error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
