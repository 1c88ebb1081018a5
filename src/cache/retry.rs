//! Bounded retry with exponential backoff.
//!
//! An explicit value type rather than a wrapper macro, so the backoff
//! schedule can be tested independently of any remote call.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        let delay = self.min_delay.saturating_mul(factor) / 2;
        delay.clamp(self.min_delay, self.max_delay)
    }

    /// Run `op` up to `max_attempts` times, sleeping between attempts.
    /// Returns the last error when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                }
            }
        }
    }
}
