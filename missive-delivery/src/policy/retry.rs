//! Retry policy for deferred recipients

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::queue::retry::calculate_backoff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which a still-deferred recipient is given up on
    ///
    /// Default: 25 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// The delay is calculated as `base * 2^(attempts - 1)`
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Default: 86400 seconds (24 hours)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    #[must_use]
    pub const fn backoff(&self, attempt_count: u32) -> Duration {
        calculate_backoff(
            attempt_count,
            self.base_retry_delay_secs,
            self.max_retry_delay_secs,
        )
    }

    /// When an entry last attempted at `last_attempt` becomes eligible again
    #[must_use]
    pub fn next_attempt_at(&self, last_attempt: SystemTime, attempt_count: u32) -> SystemTime {
        last_attempt + self.backoff(attempt_count)
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempt_count: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt_count)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        25
    }

    pub const fn base_retry_delay_secs() -> u64 {
        300
    }

    pub const fn max_retry_delay_secs() -> u64 {
        86400
    }
}
