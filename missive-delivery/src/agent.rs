//! Pool of transfer agents with health tracking
//!
//! Each agent moves between two states, in the manner of a circuit breaker:
//!
//! ```text
//! ┌─────────┐  consecutive failures >= threshold  ┌───────────┐
//! │ Healthy │ ──────────────────────────────────> │ Unhealthy │
//! └─────────┘                                      └───────────┘
//!     ^                                                  │
//!     │                                                  │ cool-down elapsed
//!     │  success                                         v
//!     └──────────────────────────────────────────── ┌───────┐
//!                                                   │ Trial │ ── failure ──> Unhealthy
//!                                                   └───────┘                 (cool-down restarts)
//! ```
//!
//! Only one trial transfer per agent is outstanding at a time. Healthy agents are
//! chosen least-recently-used first.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use missive_common::tracing;
use serde::{Deserialize, Serialize};

use crate::{error::AgentError, transfer::TransferAgent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPoolConfig {
    /// Consecutive failures after which an agent is taken out of rotation
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an unhealthy agent rests before it is tried again (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown_secs() -> u64 {
    300
}

/// Milliseconds since the epoch, never zero so zero can mean "unset"
fn millis(at: SystemTime) -> u64 {
    let ms = at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX).max(1)
}

fn from_millis(ms: u64) -> Option<SystemTime> {
    (ms != 0).then(|| SystemTime::UNIX_EPOCH + Duration::from_millis(ms))
}

#[derive(Debug)]
struct AgentSlot {
    agent: Arc<dyn TransferAgent>,
    consecutive_failures: AtomicU32,
    last_success: AtomicU64,
    last_used: AtomicU64,
    unhealthy_since: AtomicU64,
    on_trial: AtomicBool,
}

impl AgentSlot {
    fn new(agent: Arc<dyn TransferAgent>) -> Self {
        Self {
            agent,
            consecutive_failures: AtomicU32::new(0),
            last_success: AtomicU64::new(0),
            last_used: AtomicU64::new(0),
            unhealthy_since: AtomicU64::new(0),
            on_trial: AtomicBool::new(false),
        }
    }

    fn is_healthy(&self) -> bool {
        self.unhealthy_since.load(Ordering::Acquire) == 0
    }

    fn cooled_down(&self, now: u64, cooldown: u64) -> bool {
        let since = self.unhealthy_since.load(Ordering::Acquire);
        since != 0 && now.saturating_sub(since) >= cooldown
    }
}

/// Snapshot of one agent's health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentHealth {
    pub id: String,
    pub consecutive_failures: u32,
    pub last_success: Option<SystemTime>,
    pub available: bool,
}

/// The agent a dispatcher should use for one envelope
#[derive(Debug, Clone)]
pub struct SelectedAgent {
    pub agent: Arc<dyn TransferAgent>,
    /// This attempt decides whether an unhealthy agent returns to rotation
    pub trial: bool,
}

#[derive(Debug)]
pub struct AgentPool {
    agents: Vec<AgentSlot>,
    config: AgentPoolConfig,
}

impl AgentPool {
    #[must_use]
    pub fn new(agents: Vec<Arc<dyn TransferAgent>>, config: AgentPoolConfig) -> Self {
        Self {
            agents: agents.into_iter().map(AgentSlot::new).collect(),
            config,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn slot(&self, agent_id: &str) -> Option<&AgentSlot> {
        self.agents.iter().find(|slot| slot.agent.id() == agent_id)
    }

    /// Pick the least recently used healthy agent, or failing that an
    /// unhealthy agent whose cool-down has elapsed as a trial.
    pub fn select_agent(&self, now: SystemTime) -> Result<SelectedAgent, AgentError> {
        let now_ms = millis(now);

        if let Some(slot) = self
            .agents
            .iter()
            .filter(|slot| slot.is_healthy())
            .min_by_key(|slot| slot.last_used.load(Ordering::Acquire))
        {
            slot.last_used.store(now_ms, Ordering::Release);
            return Ok(SelectedAgent {
                agent: Arc::clone(&slot.agent),
                trial: false,
            });
        }

        let cooldown_ms = self.config.cooldown_secs.saturating_mul(1000);
        let mut candidates: Vec<_> = self
            .agents
            .iter()
            .filter(|slot| slot.cooled_down(now_ms, cooldown_ms))
            .collect();
        candidates.sort_by_key(|slot| slot.last_used.load(Ordering::Acquire));

        for slot in candidates {
            if slot
                .on_trial
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(agent = %slot.agent.id(), "Trying unhealthy transfer agent again");
                slot.last_used.store(now_ms, Ordering::Release);
                return Ok(SelectedAgent {
                    agent: Arc::clone(&slot.agent),
                    trial: true,
                });
            }
        }

        Err(AgentError::NoAgentAvailable)
    }

    /// Feed the result of a transfer call back into the agent's health
    pub fn report_outcome(&self, agent_id: &str, success: bool, now: SystemTime) {
        let Some(slot) = self.slot(agent_id) else {
            tracing::warn!(agent = %agent_id, "Outcome reported for unknown transfer agent");
            return;
        };

        let now_ms = millis(now);

        if success {
            slot.consecutive_failures.store(0, Ordering::Release);
            slot.last_success.store(now_ms, Ordering::Release);
            if slot.unhealthy_since.swap(0, Ordering::AcqRel) != 0 {
                tracing::info!(agent = %agent_id, "Transfer agent recovered");
            }
            slot.on_trial.store(false, Ordering::Release);
            return;
        }

        let failures = slot.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if slot.on_trial.swap(false, Ordering::AcqRel) {
            slot.unhealthy_since.store(now_ms, Ordering::Release);
            tracing::warn!(
                agent = %agent_id,
                failures,
                "Trial transfer failed, agent stays unhealthy"
            );
        } else if failures >= self.config.failure_threshold
            && slot
                .unhealthy_since
                .compare_exchange(0, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::warn!(
                agent = %agent_id,
                failures,
                threshold = self.config.failure_threshold,
                "Transfer agent marked unhealthy"
            );
        }
    }

    #[must_use]
    pub fn health(&self) -> Vec<AgentHealth> {
        self.agents
            .iter()
            .map(|slot| AgentHealth {
                id: slot.agent.id().to_string(),
                consecutive_failures: slot.consecutive_failures.load(Ordering::Acquire),
                last_success: from_millis(slot.last_success.load(Ordering::Acquire)),
                available: slot.is_healthy(),
            })
            .collect()
    }
}
