//! Classification-driven retry with capped exponential backoff and jitter.
//!
//! Used by the HTTP layer only. The span pipeline never retries through
//! this: its retry behavior is a second queue, not a sleep loop.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Run `operation` up to `attempts` times in total, sleeping between
    /// tries. Stops immediately on success or on a non-retryable error
    /// (see [`crate::error::LoopError::is_retryable`]).
    pub async fn retry<T, F, Fut>(&self, attempts: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if !error.is_retryable() || attempt >= attempts {
                        return Err(error);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        let jitter = capped.mul_f64(JITTER_FACTOR * fastrand::f64());
        capped + jitter
    }
}
