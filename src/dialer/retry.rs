//! Retry Policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt budget and linear backoff for one dial
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_unit: Duration,
    /// Ceiling for a single backoff sleep; `None` lets it grow without bound
    #[serde(with = "humantime_serde")]
    pub max_backoff: Option<Duration>,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 30_000;

    /// Uncapped linear backoff of `unit`, `2 * unit`, `3 * unit`, ...
    pub fn linear(unit: Duration) -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff_unit: unit,
            max_backoff: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Option<Duration>) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Sleep after the failure of the zero-based attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff_unit.saturating_mul(attempt.saturating_add(1));
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Total time spent sleeping if every attempt fails.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(1)).with_max_backoff(Some(Duration::from_secs(60)))
    }
}
