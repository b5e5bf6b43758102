//! Per-recipient delivery ledger
//!
//! Every recipient of an envelope owns exactly one [`RecipientEntry`]. Entries
//! only move forward along the [`RecipientStatus`] transition table; a manual
//! override pushes the current record into the entry's superseded history
//! instead of rewriting it.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::RecipientStatus;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The requested change is not an edge of the recipient state machine.
    #[error("Invalid transition for {recipient}: {from} -> {to}")]
    InvalidTransition {
        recipient: String,
        from: RecipientStatus,
        to: RecipientStatus,
    },

    /// The envelope has no ledger entry for this address.
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),
}

/// What one transfer attempt produced for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// The relay took the message and will report final delivery later
    Accepted { response: String },
    /// The relay confirmed final delivery
    Delivered { response: String },
    /// Transient failure, eligible for retry
    Deferred { response: String },
    /// Permanent rejection by the remote side
    Bounced { response: String },
    /// Local policy refused to attempt this recipient
    Blocked { reason: String },
}

impl AttemptOutcome {
    /// The status this outcome moves an entry to. `Accepted` keeps the
    /// current status and marks the entry as in transit.
    #[must_use]
    pub const fn target(&self) -> Option<RecipientStatus> {
        match self {
            Self::Accepted { .. } => None,
            Self::Delivered { .. } => Some(RecipientStatus::Sent),
            Self::Deferred { .. } => Some(RecipientStatus::Deferred),
            Self::Bounced { .. } => Some(RecipientStatus::Bounced),
            Self::Blocked { .. } => Some(RecipientStatus::Blocked),
        }
    }

    #[must_use]
    pub fn response(&self) -> &str {
        match self {
            Self::Accepted { response }
            | Self::Delivered { response }
            | Self::Deferred { response }
            | Self::Bounced { response } => response,
            Self::Blocked { reason } => reason,
        }
    }
}

/// Result of applying a change to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The change was a replay of what is already recorded
    Unchanged,
    /// The record was updated. `from` and `to` may be equal, e.g. for a
    /// repeated deferral or a hand-off to a tracking relay.
    Updated {
        from: RecipientStatus,
        to: RecipientStatus,
    },
}

impl Transition {
    #[must_use]
    pub const fn status_changed(self) -> bool {
        match self {
            Self::Unchanged => false,
            Self::Updated { from, to } => !matches!(
                (from, to),
                (RecipientStatus::Pending, RecipientStatus::Pending)
                    | (RecipientStatus::Sent, RecipientStatus::Sent)
                    | (RecipientStatus::Deferred, RecipientStatus::Deferred)
                    | (RecipientStatus::Bounced, RecipientStatus::Bounced)
                    | (RecipientStatus::Blocked, RecipientStatus::Blocked)
            ),
        }
    }
}

/// The relay an accepted message was handed to, and the receipt it gave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub agent: String,
    pub token: Option<String>,
}

/// A record pushed aside by a manual retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersededRecord {
    pub status: RecipientStatus,
    pub attempts: u32,
    pub response: Option<String>,
    pub exhausted: bool,
    pub last_attempt_at: Option<SystemTime>,
    pub superseded_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientEntry {
    recipient: String,
    status: RecipientStatus,
    attempts: u32,
    last_attempt_at: Option<SystemTime>,
    response: Option<String>,
    in_transit: bool,
    #[serde(default)]
    handoff: Option<Handoff>,
    exhausted: bool,
    superseded: Vec<SupersededRecord>,
}

impl RecipientEntry {
    #[must_use]
    pub const fn new(recipient: String) -> Self {
        Self {
            recipient,
            status: RecipientStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            response: None,
            in_transit: false,
            handoff: None,
            exhausted: false,
            superseded: Vec::new(),
        }
    }

    #[must_use]
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    #[must_use]
    pub const fn status(&self) -> RecipientStatus {
        self.status
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn last_attempt_at(&self) -> Option<SystemTime> {
        self.last_attempt_at
    }

    /// Last remote status code/reason, as reported
    #[must_use]
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Handed to a tracking relay and awaiting its confirmation
    #[must_use]
    pub const fn in_transit(&self) -> bool {
        self.in_transit
    }

    /// Where the last accepted transfer went
    #[must_use]
    pub const fn handoff(&self) -> Option<&Handoff> {
        self.handoff.as_ref()
    }

    /// Forced terminal by the retry scheduler
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.exhausted
    }

    #[must_use]
    pub fn superseded(&self) -> &[SupersededRecord] {
        &self.superseded
    }

    /// Whether the dispatcher should transfer to this recipient
    #[must_use]
    pub const fn is_dispatchable(&self) -> bool {
        !self.in_transit && matches!(self.status, RecipientStatus::Pending | RecipientStatus::Deferred)
    }

    fn invalid(&self, to: RecipientStatus) -> LedgerError {
        LedgerError::InvalidTransition {
            recipient: self.recipient.clone(),
            from: self.status,
            to,
        }
    }

    /// Record the outcome of a transfer attempt made at `at`.
    ///
    /// Replaying an outcome that is already recorded (same status and
    /// response, and not newer than the recorded attempt) is a no-op.
    pub fn record_attempt(
        &mut self,
        outcome: &AttemptOutcome,
        at: SystemTime,
    ) -> Result<Transition, LedgerError> {
        let target = outcome.target().unwrap_or(self.status);
        let accepted = outcome.target().is_none();

        let replay = self.status == target
            && self.response.as_deref() == Some(outcome.response())
            && self.in_transit == accepted
            && (self.status.is_terminal() || self.last_attempt_at.is_some_and(|last| at <= last));
        if replay {
            return Ok(Transition::Unchanged);
        }

        let allowed = if accepted {
            !self.status.is_terminal()
        } else {
            self.status.can_transition_to(target)
        };
        if !allowed {
            return Err(self.invalid(target));
        }

        let from = self.status;
        self.status = target;
        self.response = Some(outcome.response().to_string());
        self.last_attempt_at = Some(at);
        self.in_transit = accepted;
        if !accepted {
            self.handoff = None;
        }

        // A policy veto never reached the remote side
        if !matches!(outcome, AttemptOutcome::Blocked { .. }) {
            self.attempts = self.attempts.saturating_add(1);
        }

        Ok(Transition::Updated { from, to: target })
    }

    /// Apply a status reported asynchronously by a relay. Does not count as
    /// an attempt and clears the in-transit flag.
    ///
    /// Ordering and de-duplication of reports is the caller's concern; this
    /// only enforces the transition table.
    pub fn settle(
        &mut self,
        status: RecipientStatus,
        response: &str,
        at: SystemTime,
    ) -> Result<Transition, LedgerError> {
        if !self.status.can_transition_to(status) {
            return Err(self.invalid(status));
        }

        let from = self.status;
        self.status = status;
        self.response = Some(response.to_string());
        self.last_attempt_at = Some(at);
        self.in_transit = false;
        self.handoff = None;

        Ok(Transition::Updated { from, to: status })
    }

    /// Remember which relay holds an accepted message. Ignored unless the
    /// entry is in transit.
    pub fn record_handoff(&mut self, agent: &str, token: Option<&str>) {
        if self.in_transit {
            self.handoff = Some(Handoff {
                agent: agent.to_string(),
                token: token.map(str::to_string),
            });
        }
    }

    /// Give up waiting for a relay confirmation. The entry goes back to
    /// `Deferred`; the hand-off already counted as an attempt, and a late
    /// report newer than it can still settle the entry.
    pub fn expire_transit(&mut self, reason: &str) -> Result<Transition, LedgerError> {
        if !self.in_transit {
            return Err(self.invalid(RecipientStatus::Deferred));
        }

        let from = self.status;
        self.status = RecipientStatus::Deferred;
        self.in_transit = false;
        self.response = Some(reason.to_string());

        Ok(Transition::Updated {
            from,
            to: RecipientStatus::Deferred,
        })
    }

    /// Force a deferred entry into the terminal "exhausted retries" state
    pub fn exhaust(&mut self, reason: &str) -> Result<Transition, LedgerError> {
        if self.status != RecipientStatus::Deferred || self.in_transit {
            return Err(self.invalid(RecipientStatus::Bounced));
        }

        self.status = RecipientStatus::Bounced;
        self.exhausted = true;
        self.response = Some(reason.to_string());

        Ok(Transition::Updated {
            from: RecipientStatus::Deferred,
            to: RecipientStatus::Bounced,
        })
    }

    /// Manual override of a terminal failure: the current record is
    /// superseded and the entry starts a fresh retry budget as `Deferred`.
    pub fn reopen(&mut self, at: SystemTime) -> Result<Transition, LedgerError> {
        if !matches!(
            self.status,
            RecipientStatus::Bounced | RecipientStatus::Blocked
        ) {
            return Err(self.invalid(RecipientStatus::Deferred));
        }

        self.superseded.push(SupersededRecord {
            status: self.status,
            attempts: self.attempts,
            response: self.response.take(),
            exhausted: self.exhausted,
            last_attempt_at: self.last_attempt_at,
            superseded_at: at,
        });

        let from = self.status;
        self.status = RecipientStatus::Deferred;
        self.attempts = 0;
        self.exhausted = false;
        self.in_transit = false;
        self.handoff = None;
        self.last_attempt_at = Some(at);

        Ok(Transition::Updated {
            from,
            to: RecipientStatus::Deferred,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn entry() -> RecipientEntry {
        RecipientEntry::new("rcpt@example.com".to_string())
    }

    fn deferred(code: &str) -> AttemptOutcome {
        AttemptOutcome::Deferred {
            response: code.to_string(),
        }
    }

    #[test]
    fn pending_to_sent() {
        let mut entry = entry();
        let now = SystemTime::now();

        let transition = entry
            .record_attempt(
                &AttemptOutcome::Delivered {
                    response: "250 OK".to_string(),
                },
                now,
            )
            .unwrap();

        assert_eq!(
            transition,
            Transition::Updated {
                from: RecipientStatus::Pending,
                to: RecipientStatus::Sent
            }
        );
        assert_eq!(entry.status(), RecipientStatus::Sent);
        assert_eq!(entry.attempts(), 1);
        assert_eq!(entry.response(), Some("250 OK"));
        assert_eq!(entry.last_attempt_at(), Some(now));
    }

    #[test]
    fn deferred_loops_and_counts_attempts() {
        let mut entry = entry();
        let start = SystemTime::now();

        entry.record_attempt(&deferred("421 busy"), start).unwrap();
        entry
            .record_attempt(&deferred("421 busy"), start + Duration::from_secs(60))
            .unwrap();

        assert_eq!(entry.status(), RecipientStatus::Deferred);
        assert_eq!(entry.attempts(), 2);
    }

    #[test]
    fn identical_replay_is_noop() {
        let mut entry = entry();
        let now = SystemTime::now();

        entry.record_attempt(&deferred("421 busy"), now).unwrap();
        let before = entry.clone();

        assert_eq!(
            entry.record_attempt(&deferred("421 busy"), now).unwrap(),
            Transition::Unchanged
        );
        assert_eq!(entry, before);

        let delivered = AttemptOutcome::Delivered {
            response: "250 OK".to_string(),
        };
        entry.record_attempt(&delivered, now).unwrap();
        let before = entry.clone();
        assert_eq!(
            entry
                .record_attempt(&delivered, now + Duration::from_secs(5))
                .unwrap(),
            Transition::Unchanged
        );
        assert_eq!(entry, before);
    }

    #[test]
    fn terminal_rejects_other_outcomes() {
        let mut entry = entry();
        let now = SystemTime::now();

        entry
            .record_attempt(
                &AttemptOutcome::Bounced {
                    response: "550 no such user".to_string(),
                },
                now,
            )
            .unwrap();

        let err = entry
            .record_attempt(
                &AttemptOutcome::Delivered {
                    response: "250 OK".to_string(),
                },
                now,
            )
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                recipient: "rcpt@example.com".to_string(),
                from: RecipientStatus::Bounced,
                to: RecipientStatus::Sent,
            }
        );
        assert!(
            entry
                .record_attempt(
                    &AttemptOutcome::Accepted {
                        response: "250 queued".to_string()
                    },
                    now
                )
                .is_err()
        );
    }

    #[test]
    fn blocked_is_not_an_attempt() {
        let mut entry = entry();
        entry
            .record_attempt(
                &AttemptOutcome::Blocked {
                    reason: "domain blocklisted".to_string(),
                },
                SystemTime::now(),
            )
            .unwrap();

        assert_eq!(entry.status(), RecipientStatus::Blocked);
        assert_eq!(entry.attempts(), 0);
    }

    #[test]
    fn accepted_marks_in_transit() {
        let mut entry = entry();
        let now = SystemTime::now();

        let transition = entry
            .record_attempt(
                &AttemptOutcome::Accepted {
                    response: "250 queued as ABC".to_string(),
                },
                now,
            )
            .unwrap();

        assert!(!transition.status_changed());
        assert_eq!(entry.status(), RecipientStatus::Pending);
        assert!(entry.in_transit());
        assert!(!entry.is_dispatchable());

        entry
            .settle(RecipientStatus::Sent, "250 delivered", now)
            .unwrap();
        assert!(!entry.in_transit());
        assert_eq!(entry.status(), RecipientStatus::Sent);
        assert_eq!(entry.attempts(), 1);
    }

    #[test]
    fn handoff_only_while_in_transit() {
        let mut entry = entry();
        let now = SystemTime::now();

        entry.record_handoff("relay-1", Some("receipt-1"));
        assert_eq!(entry.handoff(), None);

        entry
            .record_attempt(
                &AttemptOutcome::Accepted {
                    response: "250 queued".to_string(),
                },
                now,
            )
            .unwrap();
        entry.record_handoff("relay-1", Some("receipt-1"));
        assert_eq!(
            entry.handoff(),
            Some(&Handoff {
                agent: "relay-1".to_string(),
                token: Some("receipt-1".to_string()),
            })
        );

        entry
            .record_attempt(&deferred("421 busy"), now + Duration::from_secs(1))
            .unwrap();
        assert_eq!(entry.handoff(), None);
    }

    #[test]
    fn expired_transit_returns_to_retry() {
        let mut entry = entry();
        let now = SystemTime::now();

        assert!(entry.expire_transit("no confirmation").is_err());

        entry
            .record_attempt(
                &AttemptOutcome::Accepted {
                    response: "250 queued".to_string(),
                },
                now,
            )
            .unwrap();
        entry.expire_transit("no confirmation").unwrap();

        assert_eq!(entry.status(), RecipientStatus::Deferred);
        assert!(!entry.in_transit());
        assert!(entry.is_dispatchable());
        assert_eq!(entry.attempts(), 1);
        assert_eq!(entry.last_attempt_at(), Some(now));

        // A late confirmation still settles the entry
        entry
            .settle(RecipientStatus::Sent, "250 delivered", now + Duration::from_secs(1))
            .unwrap();
        assert_eq!(entry.status(), RecipientStatus::Sent);
    }

    #[test]
    fn settle_respects_table() {
        let mut entry = entry();
        let now = SystemTime::now();
        entry.settle(RecipientStatus::Sent, "250", now).unwrap();

        assert!(entry.settle(RecipientStatus::Deferred, "421", now).is_err());
        assert!(entry.settle(RecipientStatus::Pending, "", now).is_err());
    }

    #[test]
    fn exhaust_and_reopen() {
        let mut entry = entry();
        let now = SystemTime::now();

        assert!(entry.exhaust("exhausted retries").is_err());

        entry.record_attempt(&deferred("421 busy"), now).unwrap();
        entry.exhaust("exhausted retries").unwrap();
        assert_eq!(entry.status(), RecipientStatus::Bounced);
        assert!(entry.exhausted());

        entry.reopen(now).unwrap();
        assert_eq!(entry.status(), RecipientStatus::Deferred);
        assert_eq!(entry.attempts(), 0);
        assert!(!entry.exhausted());
        assert_eq!(entry.superseded().len(), 1);
        assert_eq!(entry.superseded()[0].status, RecipientStatus::Bounced);
        assert!(entry.superseded()[0].exhausted);
        assert_eq!(entry.superseded()[0].attempts, 1);
    }

    #[test]
    fn sent_cannot_be_reopened() {
        let mut entry = entry();
        entry
            .settle(RecipientStatus::Sent, "250", SystemTime::now())
            .unwrap();
        assert!(entry.reopen(SystemTime::now()).is_err());
    }
}
