//! Backoff policy for chunk transfers.

use super::transport::TransferFailure;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay that may be shaved off at random, 0.0..=1.0.
    pub jitter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Retries immediately; used where waiting buys nothing, e.g. tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Decide what to do after `attempts` attempts have failed, the last one
    /// with `failure`.
    pub fn decide(&self, attempts: u32, failure: &TransferFailure) -> RetryDecision {
        if !failure.is_transient() || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = self.backoff_delay(attempts);
        let delay = match failure.retry_after() {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        RetryDecision::Retry(delay)
    }

    /// Exponential delay for the retry following attempt number `attempts`
    /// (1-based), capped at `max_delay`, with jitter applied.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter <= 0.0 || raw.is_zero() {
            return raw;
        }

        let shave = self.jitter * rand::random::<f64>();
        raw.mul_f64(1.0 - shave)
    }
}
