use std::time::Duration;

use serde::Deserialize;

use crate::{
    agent::AgentPoolConfig,
    policy::{BlockPolicy, RetryPolicy},
};

const fn default_workers() -> usize {
    4
}

const fn default_dispatch_interval_ms() -> u64 {
    500
}

const fn default_status_poll_interval_secs() -> u64 {
    300
}

const fn default_transfer_timeout_secs() -> u64 {
    30
}

const fn default_agent_retry_delay_secs() -> u64 {
    60
}

const fn default_max_recipients() -> usize {
    100
}

const fn default_status_batch_size() -> usize {
    250
}

const fn default_status_feed_max_failures() -> u32 {
    3
}

const fn default_status_feed_backoff_ms() -> u64 {
    1000
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

const fn default_event_capacity() -> usize {
    1024
}

const fn default_confirmation_timeout_secs() -> u64 {
    86_400
}

/// Tunables for the delivery pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent dispatcher workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idle worker waits before looking for work again
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// How often tracked envelopes are polled for delivery statuses
    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: u64,

    /// Deadline for a single transfer call
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,

    /// Delay before an envelope is retried when no agent was available
    #[serde(default = "default_agent_retry_delay_secs")]
    pub agent_retry_delay_secs: u64,

    /// Upper bound on recipients per envelope, checked at submission
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Envelopes per status feed request
    #[serde(default = "default_status_batch_size")]
    pub status_batch_size: usize,

    /// Feed failures tolerated in one reconciliation pass
    #[serde(default = "default_status_feed_max_failures")]
    pub status_feed_max_failures: u32,

    /// Unit of the `2^n` pause between failed feed requests
    #[serde(default = "default_status_feed_backoff_ms")]
    pub status_feed_backoff_ms: u64,

    /// How long shutdown waits for in-flight transfers
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Buffered delivery events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How long a relay hand-off may stay unconfirmed before the recipient
    /// is retried
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub block: BlockPolicy,

    #[serde(default)]
    pub agents: AgentPoolConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            status_poll_interval_secs: default_status_poll_interval_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            agent_retry_delay_secs: default_agent_retry_delay_secs(),
            max_recipients: default_max_recipients(),
            status_batch_size: default_status_batch_size(),
            status_feed_max_failures: default_status_feed_max_failures(),
            status_feed_backoff_ms: default_status_feed_backoff_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            event_capacity: default_event_capacity(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            retry: RetryPolicy::default(),
            block: BlockPolicy::default(),
            agents: AgentPoolConfig::default(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    #[must_use]
    pub const fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    #[must_use]
    pub const fn agent_retry_delay(&self) -> Duration {
        Duration::from_secs(self.agent_retry_delay_secs)
    }

    #[must_use]
    pub const fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Pause before the next feed request after `failures` failed ones
    #[must_use]
    pub fn status_feed_backoff(&self, failures: u32) -> Duration {
        let factor = 1_u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.status_feed_backoff_ms.saturating_mul(factor))
    }
}
