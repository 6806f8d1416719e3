// Retry strategy for store client connection attempts
// Delay grows linearly with the attempt number and is capped, with optional jitter.

use rand::Rng;
use std::time::Duration;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt
    /// Returns None if max attempts exceeded
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of attempts
    fn max_attempts(&self) -> u32;

    /// Check if more attempts are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Backoff handed to the connection manager for reconnects after the
    /// first successful connect
    fn reconnect_backoff(&self) -> ReconnectBackoff;
}

/// Parameters of redis' exponential reconnect backoff.
///
/// Delay `i` (from 1) is `factor_ms * exponent_base^i`, for `retries` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub exponent_base: u64,
    pub factor_ms: u64,
    pub retries: usize,
}

impl ReconnectBackoff {
    /// Delay before reconnect try `attempt` (from 1), without jitter
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.exponent_base
            .saturating_pow(attempt)
            .saturating_mul(self.factor_ms)
    }
}

/// Capped backoff: `min(attempt * step, max)` plus up to `jitter` of that
#[derive(Debug, Clone)]
pub struct CappedBackoff {
    step_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for CappedBackoff {
    fn default() -> Self {
        Self {
            step_ms: 30,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
            max_attempts: 10,
        }
    }
}

impl CappedBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(step_ms: u64, max_delay_ms: u64, jitter_factor: f64, max_attempts: u32) -> Self {
        Self {
            step_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        self.step_ms
            .saturating_mul(u64::from(attempt))
            .min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return base_delay_ms;
        }

        base_delay_ms + rand::thread_rng().gen_range(0..=jitter_range_ms)
    }
}

impl RetryStrategy for CappedBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }

        let base_delay_ms = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_ms)))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Doubling from `step`, with only as many tries as stay within `max`
    /// (and within the attempt limit). The manager cannot cap a delay, so
    /// the cap bounds the number of tries instead.
    fn reconnect_backoff(&self) -> ReconnectBackoff {
        let base = ReconnectBackoff {
            exponent_base: 2,
            factor_ms: (self.step_ms / 2).max(1),
            retries: 0,
        };
        let mut retries = 1;
        while retries < self.max_attempts
            && base.delay_ms(retries + 1) <= self.max_delay_ms.max(self.step_ms)
        {
            retries += 1;
        }
        ReconnectBackoff {
            retries: retries as usize,
            ..base
        }
    }
}
