//! Retry policy for transient store faults

use rand::Rng;
use shardmap_common::config::RetryConfig;
use shardmap_common::{Error, ErrorCode, Result};
use std::time::{Duration, Instant};
use tracing::warn;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_elapsed: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        let base_delay = Duration::from_millis(config.base_delay_ms);
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(config.max_delay_ms).max(base_delay),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
        }
    }

    /// Policy that runs every call exactly once
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// Doubles per attempt up to the cap, plus up to a quarter of jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter_cap = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        if jitter_cap == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        delay + Duration::from_millis(jitter)
    }

    /// Run `f` until it succeeds, fails permanently or the budget runs out
    ///
    /// Exhausting the budget on a transient error surfaces
    /// `StoreUnreachable` carrying the last error.
    pub fn run<T>(&self, name: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            let err = match f() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            let delay = self.backoff(attempt);
            if attempt >= self.max_attempts || started.elapsed() + delay > self.max_elapsed {
                if self.max_attempts == 1 {
                    return Err(err);
                }
                return Err(Error::new(
                    ErrorCode::StoreUnreachable,
                    format!("{name} gave up after {attempt} attempts: {err}"),
                ));
            }
            warn!(
                operation = name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient store fault, retrying"
            );
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
