//! Exponential backoff for reconnection attempts
//!
//! Pure decision logic, kept apart from the reconnect loop so it can be
//! tested without any I/O. The delay after the n-th consecutive failure is
//! `min(initial * 2^(n-1), max)`; once that delay reaches the ceiling the
//! retry budget is considered exhausted.

use std::time::Duration;

/// Default delay after the first failed connection attempt
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Default ceiling; reaching it is fatal (2 hours)
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(7200);

/// Backoff policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Delay for a given retry factor: `min(initial * 2^factor, max)`
    pub fn delay_for(&self, retry_factor: u32) -> Duration {
        2u32.checked_pow(retry_factor)
            .and_then(|multiplier| self.initial_delay.checked_mul(multiplier))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Number of failures tolerated before the budget is exhausted
    pub fn max_retries(&self) -> u32 {
        let mut factor = 0;
        while self.delay_for(factor) < self.max_delay {
            factor += 1;
        }
        factor
    }

    /// Validate policy values
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("initial retry delay must be greater than 0".to_string());
        }
        if self.max_delay <= self.initial_delay {
            return Err(format!(
                "max retry delay ({:?}) must be greater than the initial delay ({:?})",
                self.max_delay, self.initial_delay
            ));
        }
        Ok(())
    }
}

/// Outcome of recording a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Sleep `delay` and then make attempt number `next_attempt`
    Retry {
        failed_attempt: u32,
        delay: Duration,
        next_attempt: u32,
    },
    /// The delay reached the ceiling - stop retrying
    Exhausted { failed_attempt: u32, delay: Duration },
}

/// Mutable backoff state of one runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    retry_factor: u32,
    attempt: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            retry_factor: 0,
            attempt: 1,
        }
    }

    /// Number of the next connection attempt (1-based)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retry_factor(&self) -> u32 {
        self.retry_factor
    }

    /// Back to initial values; called only when a connection succeeds
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record a failed attempt and decide what to do next
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> BackoffDecision {
        let failed_attempt = self.attempt;
        let delay = policy.delay_for(self.retry_factor);

        if delay >= policy.max_delay {
            return BackoffDecision::Exhausted {
                failed_attempt,
                delay,
            };
        }

        self.retry_factor += 1;
        self.attempt += 1;
        BackoffDecision::Retry {
            failed_attempt,
            delay,
            next_attempt: self.attempt,
        }
    }
}
