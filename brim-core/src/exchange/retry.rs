//! Retry with exponential backoff and deterministic jitter
//!
//! Transient exchange errors are retried with exponential backoff. Jitter is
//! deterministic, seeded from the idempotency key and attempt number, so a
//! given retry schedule is reproducible in tests and two concurrent retries
//! of different mutations do not synchronize.

use crate::core::errors::ExchangeError;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { base, max, max_attempts }
    }

    /// Delay before retry number `attempt` (1-based), jittered by up to
    /// +-15% from a hash of `(seed, attempt)`.
    pub fn delay(&self, seed: &str, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max);

        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        attempt.hash(&mut hasher);
        // Map hash onto [0.85, 1.15].
        let unit = (hasher.finish() % 10_000) as f64 / 10_000.0;
        let factor = 0.85 + unit * 0.30;
        Duration::from_secs_f64(exp.as_secs_f64() * factor)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts are exhausted.
    /// Only transient errors are retried. `on_result` observes every
    /// attempt's outcome (the circuit gate hooks in here).
    pub async fn run<T, F, Fut>(
        &self,
        idem_key: &str,
        mut op: F,
        on_result: impl Fn(&Result<T, ExchangeError>),
    ) -> Result<T, ExchangeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 1u32;
        loop {
            let result = op(attempt).await;
            on_result(&result);
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(idem_key, attempt);
                    debug!(idem_key, attempt, delay_ms = delay.as_millis() as u64,
                        error = %err, "transient exchange error; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
