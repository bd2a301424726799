//! Capped exponential-backoff policy for push reconnection.
//!
//! The delay before reconnect attempt `n` (0-based) is
//! `base_delay * 2^n`. After `max_attempts` consecutive failures the
//! policy is exhausted and the push channel degrades to poll-only.

use std::time::Duration;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// Delay before the 0-based reconnect `attempt`.
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config.base_delay.saturating_mul(factor)
}

/// Attempt counter for one push channel.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let delay = backoff_delay(self.attempt, &self.config);
        self.attempt += 1;
        Some(delay)
    }

    /// Number of attempts scheduled since the last reset (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Start counting again after a healthy connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
