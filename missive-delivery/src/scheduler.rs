//! Retry scheduling
//!
//! Decides, after every change to an envelope's ledger, whether the envelope
//! goes back into the ready set (and when), waits for relay confirmations,
//! or is finished. Hand-offs that were never confirmed go back to
//! `Deferred` once the confirmation timeout passes, and deferred recipients
//! that have used up their attempts are forced to the exhausted state here.

use std::time::{Duration, SystemTime};

use missive_common::{Envelope, RecipientEntry, RecipientStatus, internal};

use crate::{policy::RetryPolicy, queue::Disposition};

const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    confirmation_timeout: Duration,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryScheduler {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    /// How long a hand-off to a tracking relay may stay unconfirmed
    #[must_use]
    pub const fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// When `entry` may next be transferred, or `None` if it is not waiting
    /// on a transfer at all
    #[must_use]
    pub fn due_at(&self, entry: &RecipientEntry, now: SystemTime) -> Option<SystemTime> {
        if !entry.is_dispatchable() {
            return None;
        }

        Some(entry.last_attempt_at().map_or(now, |last| {
            self.policy.next_attempt_at(last, entry.attempts())
        }))
    }

    /// When an in-transit entry stops waiting for its relay
    #[must_use]
    pub fn confirmation_deadline(&self, entry: &RecipientEntry) -> Option<SystemTime> {
        if !entry.in_transit() {
            return None;
        }

        entry
            .last_attempt_at()
            .map(|handed_off| handed_off + self.confirmation_timeout)
    }

    /// Whether `entry` should be part of a transfer made at `now`
    #[must_use]
    pub fn is_due(&self, entry: &RecipientEntry, now: SystemTime) -> bool {
        self.due_at(entry, now).is_some_and(|due| due <= now)
    }

    /// Exhaust recipients that are out of attempts and decide where the
    /// envelope goes next. Records the decision in the envelope's
    /// next-attempt time.
    pub fn schedule(&self, envelope: &mut Envelope, now: SystemTime) -> Disposition {
        if envelope.is_cancelled() {
            envelope.set_next_attempt_at(None);
            return Disposition::Terminal;
        }

        let id = envelope.id();
        let timeout = self.confirmation_timeout;
        for entry in envelope.entries_mut() {
            if self
                .confirmation_deadline(entry)
                .is_some_and(|deadline| deadline <= now)
            {
                let reason = format!("No delivery confirmation within {timeout:?}");
                match entry.expire_transit(&reason) {
                    Ok(_) => internal!(
                        level = WARN,
                        "Stopped waiting on confirmation for {} of {id}",
                        entry.recipient()
                    ),
                    Err(err) => internal!(level = ERROR, "Unable to expire hand-off: {err}"),
                }
            }
        }

        let max_attempts = self.policy.max_attempts;
        for entry in envelope.entries_mut() {
            if entry.status() == RecipientStatus::Deferred
                && !entry.in_transit()
                && !self.policy.should_retry(entry.attempts())
            {
                let reason = format!("Exhausted retries after {} attempts", entry.attempts());
                match entry.exhaust(&reason) {
                    Ok(_) => internal!(
                        level = WARN,
                        "Giving up on {} for {id} after {max_attempts} attempts",
                        entry.recipient()
                    ),
                    Err(err) => internal!(level = ERROR, "Unable to exhaust recipient: {err}"),
                }
            }
        }

        let due = envelope
            .entries()
            .iter()
            .filter_map(|entry| self.due_at(entry, now))
            .min();
        let deadline = envelope
            .entries()
            .iter()
            .filter_map(|entry| self.confirmation_deadline(entry))
            .min();

        let disposition = match (due, deadline) {
            (Some(due), deadline) => Disposition::Retry {
                eligible_at: deadline.map_or(due, |deadline| due.min(deadline)),
            },
            (None, Some(until)) => Disposition::AwaitConfirmation { until },
            (None, None) => Disposition::Terminal,
        };

        envelope.set_next_attempt_at(match disposition {
            Disposition::Retry { eligible_at } => Some(eligible_at),
            Disposition::AwaitConfirmation { until } => Some(until),
            Disposition::Terminal => None,
        });

        disposition
    }
}
