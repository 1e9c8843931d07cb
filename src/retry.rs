//! Exponential backoff with full jitter, shared by the upstream client (§4.B)
//! and the classifier client's outer transient-error retry (§4.C).
//!
//! Grounded on the teacher's inline backoff arithmetic in
//! `dispatch/async_poll.rs::next_poll_delay` (`base * multiplier^attempt`,
//! capped), generalized here into "full jitter": `uniform(0, capped_delay)`,
//! the scheme `backoff.expo(jitter=backoff.full_jitter)` used on the Python
//! side for both the georeport and openai clients.

use std::time::Duration;

use rand::Rng;

/// One retry policy shared by upstream fetches and classifier calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// Full-jitter delay for the given zero-indexed attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base.mul_f64(2f64.powi(attempt as i32)).min(self.max);
        let jittered_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jittered_ms)
    }
}

/// Run `op` until it succeeds, a non-transient error is returned, or
/// `policy.max_attempts` is exhausted. `is_transient` classifies the error;
/// non-transient errors are returned immediately without further retries.
pub async fn retry_with_jitter<T, E, F, Fut>(
    policy: RetryPolicy,
    mut is_transient: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= policy.max_attempts || !is_transient(&e) => return Err(e),
            Err(_) => {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}
