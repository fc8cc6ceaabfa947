//! Shared jittered exponential backoff
//!
//! One policy serves both the queue engine (redelivery delays) and the
//! provider client (request-level retries), so the two never drift apart.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff parameters: `base * 2^(attempt-1)`, scaled by a uniform factor in
/// `[1 - jitter, 1 + jitter]`, rounded to milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_ms: u64, jitter: f64) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(base_ms),
            jitter,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base.as_millis() as f64 * f64::from(1u32 << exp);
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        let ms = (raw * factor).round().max(0.0);
        Duration::from_millis(ms as u64)
    }
}

/// Runs `op` until it succeeds or the attempt budget is spent. `transient`
/// decides whether an error is worth another attempt; permanent errors
/// return immediately.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && transient(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
