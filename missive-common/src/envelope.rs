use std::time::SystemTime;

use mailparse::{MailAddr, addrparse};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    id::EnvelopeId,
    ledger::{LedgerError, RecipientEntry},
    status::{MailStatus, RecipientStatus},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope has no recipients")]
    EmptyRecipientSet,

    #[error("Envelope has {count} recipients, at most {max} are allowed")]
    TooManyRecipients { count: usize, max: usize },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Envelope has already been submitted")]
    AlreadySubmitted,

    #[error("Cannot cancel an envelope that is {0}")]
    CancelNotAllowed(MailStatus),

    #[error("Cannot retry an envelope that is {0}")]
    RetryNotAllowed(MailStatus),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Opaque handle to the composed message body. The pipeline never looks
/// inside; transfer agents resolve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(String);

impl PayloadRef {
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim, lowercase and validate a single mailbox address.
///
/// Display names are discarded; groups and lists are rejected.
pub fn normalise_address(raw: &str) -> Result<String, EnvelopeError> {
    let invalid = || EnvelopeError::InvalidAddress(raw.to_string());

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let parsed = addrparse(trimmed).map_err(|_| invalid())?;
    let [MailAddr::Single(info)] = parsed.as_slice() else {
        return Err(invalid());
    };

    let addr = info.addr.trim().to_lowercase();
    match addr.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(addr),
        _ => Err(invalid()),
    }
}

/// One logical outgoing message and the delivery ledger of its recipients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    sender: String,
    recipients: Vec<RecipientEntry>,
    payload: PayloadRef,
    created_at: SystemTime,
    submitted_at: Option<SystemTime>,
    submission_count: u32,
    cancelled: bool,
    next_attempt_at: Option<SystemTime>,
    last_error: Option<String>,
}

impl Envelope {
    /// Build a draft from raw addresses. Recipients are normalised and
    /// de-duplicated, keeping the first occurrence.
    pub fn draft<I, S>(sender: &str, recipients: I, payload: PayloadRef) -> Result<Self, EnvelopeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sender = normalise_address(sender)?;

        let mut entries: Vec<RecipientEntry> = Vec::new();
        for raw in recipients {
            let address = normalise_address(raw.as_ref())?;
            if !entries.iter().any(|entry| entry.recipient() == address) {
                entries.push(RecipientEntry::new(address));
            }
        }

        Ok(Self {
            id: EnvelopeId::generate(),
            sender,
            recipients: entries,
            payload,
            created_at: SystemTime::now(),
            submitted_at: None,
            submission_count: 0,
            cancelled: false,
            next_attempt_at: None,
            last_error: None,
        })
    }

    #[must_use]
    pub const fn id(&self) -> EnvelopeId {
        self.id
    }

    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub fn entries(&self) -> &[RecipientEntry] {
        &self.recipients
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut RecipientEntry> {
        self.recipients.iter_mut()
    }

    #[must_use]
    pub fn entry(&self, recipient: &str) -> Option<&RecipientEntry> {
        self.recipients
            .iter()
            .find(|entry| entry.recipient() == recipient)
    }

    pub fn entry_mut(&mut self, recipient: &str) -> Result<&mut RecipientEntry, LedgerError> {
        self.recipients
            .iter_mut()
            .find(|entry| entry.recipient() == recipient)
            .ok_or_else(|| LedgerError::UnknownRecipient(recipient.to_string()))
    }

    #[must_use]
    pub const fn payload(&self) -> &PayloadRef {
        &self.payload
    }

    #[must_use]
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    pub const fn submitted_at(&self) -> Option<SystemTime> {
        self.submitted_at
    }

    #[must_use]
    pub const fn submission_count(&self) -> u32 {
        self.submission_count
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[must_use]
    pub const fn next_attempt_at(&self) -> Option<SystemTime> {
        self.next_attempt_at
    }

    pub const fn set_next_attempt_at(&mut self, at: Option<SystemTime>) {
        self.next_attempt_at = at;
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    /// Move a draft into the delivery pipeline
    pub fn submit(&mut self, max_recipients: usize, now: SystemTime) -> Result<(), EnvelopeError> {
        if self.submitted_at.is_some() || self.cancelled {
            return Err(EnvelopeError::AlreadySubmitted);
        }

        if self.recipients.is_empty() {
            return Err(EnvelopeError::EmptyRecipientSet);
        }

        if self.recipients.len() > max_recipients {
            return Err(EnvelopeError::TooManyRecipients {
                count: self.recipients.len(),
                max: max_recipients,
            });
        }

        self.submitted_at = Some(now);
        self.submission_count += 1;
        self.next_attempt_at = Some(now);

        Ok(())
    }

    /// Withdraw the envelope. Only possible before anything has been
    /// attempted; partial sends cannot be rolled back.
    pub fn cancel(&mut self) -> Result<(), EnvelopeError> {
        let status = self.compute_status();
        let any_sent = self
            .recipients
            .iter()
            .any(|entry| entry.status() == RecipientStatus::Sent);

        if any_sent || !matches!(status, MailStatus::Draft | MailStatus::Queued) {
            return Err(EnvelopeError::CancelNotAllowed(status));
        }

        self.cancelled = true;
        self.next_attempt_at = None;

        Ok(())
    }

    /// Whether any recipient still needs a transfer
    #[must_use]
    pub fn has_dispatchable(&self) -> bool {
        !self.cancelled && self.recipients.iter().any(RecipientEntry::is_dispatchable)
    }

    /// Whether any recipient is waiting on a relay confirmation
    #[must_use]
    pub fn awaiting_confirmation(&self) -> bool {
        self.recipients.iter().any(RecipientEntry::in_transit)
    }

    /// No recipient can change state again without a manual retry
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.cancelled
            || self
                .recipients
                .iter()
                .all(|entry| entry.status().is_terminal())
    }

    /// Overall status, derived from the recipient ledger
    #[must_use]
    pub fn compute_status(&self) -> MailStatus {
        if self.cancelled {
            return MailStatus::Cancelled;
        }

        if self.submitted_at.is_none() {
            return MailStatus::Draft;
        }

        let total = self.recipients.len();
        let sent = self
            .recipients
            .iter()
            .filter(|entry| entry.status() == RecipientStatus::Sent)
            .count();

        if total > 0 && sent == total {
            return MailStatus::Sent;
        }

        if sent > 0 {
            return MailStatus::PartiallySent;
        }

        if self.is_settled() {
            let exhausted = self.recipients.iter().any(RecipientEntry::exhausted);
            let uniform = |status| {
                self.recipients
                    .iter()
                    .all(|entry| entry.status() == status)
            };

            return if uniform(RecipientStatus::Bounced) && !exhausted {
                MailStatus::Bounced
            } else if uniform(RecipientStatus::Blocked) {
                MailStatus::Blocked
            } else {
                MailStatus::Failed
            };
        }

        let untouched = self.recipients.iter().all(|entry| {
            entry.status() == RecipientStatus::Pending && entry.attempts() == 0 && !entry.in_transit()
        });
        if untouched {
            return MailStatus::Queued;
        }

        let all_deferred = self
            .recipients
            .iter()
            .filter(|entry| !entry.status().is_terminal())
            .all(|entry| entry.status() == RecipientStatus::Deferred && !entry.in_transit());
        if all_deferred {
            return MailStatus::Deferred;
        }

        MailStatus::Pending
    }

    /// Manual retry of a `Failed` envelope: exhausted and blocked recipients
    /// get a fresh retry budget. Returns the number of re-opened recipients.
    pub fn requeue_failed(&mut self, now: SystemTime) -> Result<usize, EnvelopeError> {
        let status = self.compute_status();
        if status != MailStatus::Failed {
            return Err(EnvelopeError::RetryNotAllowed(status));
        }

        self.reopen_where(now, |entry| {
            entry.exhausted() || entry.status() == RecipientStatus::Blocked
        })
    }

    /// Manual retry of a `Bounced` envelope
    pub fn requeue_bounced(&mut self, now: SystemTime) -> Result<usize, EnvelopeError> {
        let status = self.compute_status();
        if status != MailStatus::Bounced {
            return Err(EnvelopeError::RetryNotAllowed(status));
        }

        self.reopen_where(now, |entry| entry.status() == RecipientStatus::Bounced)
    }

    fn reopen_where<F>(&mut self, now: SystemTime, predicate: F) -> Result<usize, EnvelopeError>
    where
        F: Fn(&RecipientEntry) -> bool,
    {
        let mut reopened = 0;
        for entry in self.recipients.iter_mut().filter(|entry| predicate(entry)) {
            entry.reopen(now)?;
            reopened += 1;
        }

        self.submission_count += 1;
        self.last_error = None;
        self.next_attempt_at = Some(now);

        Ok(reopened)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ledger::AttemptOutcome;

    fn envelope(recipients: &[&str]) -> Envelope {
        Envelope::draft(
            "sender@example.com",
            recipients,
            PayloadRef::new("blob://1"),
        )
        .unwrap()
    }

    fn outcome(status: RecipientStatus) -> AttemptOutcome {
        match status {
            RecipientStatus::Sent => AttemptOutcome::Delivered {
                response: "250 OK".to_string(),
            },
            RecipientStatus::Deferred => AttemptOutcome::Deferred {
                response: "421 try later".to_string(),
            },
            RecipientStatus::Bounced => AttemptOutcome::Bounced {
                response: "550 unknown user".to_string(),
            },
            RecipientStatus::Blocked => AttemptOutcome::Blocked {
                reason: "blocklisted".to_string(),
            },
            RecipientStatus::Pending => AttemptOutcome::Accepted {
                response: "250 queued".to_string(),
            },
        }
    }

    fn record(envelope: &mut Envelope, recipient: &str, status: RecipientStatus) {
        envelope
            .entry_mut(recipient)
            .unwrap()
            .record_attempt(&outcome(status), SystemTime::now())
            .unwrap();
    }

    #[test]
    fn draft_normalises_recipients() {
        let envelope = envelope(&[
            " Alice@Example.com ",
            "bob@example.com",
            "alice@example.com",
            "Carol <carol@example.com>",
        ]);

        let addresses: Vec<_> = envelope
            .entries()
            .iter()
            .map(RecipientEntry::recipient)
            .collect();
        assert_eq!(
            addresses,
            ["alice@example.com", "bob@example.com", "carol@example.com"]
        );
        assert_eq!(envelope.compute_status(), MailStatus::Draft);
    }

    #[test]
    fn draft_rejects_invalid_addresses() {
        for raw in ["", "   ", "not-an-address", "a@example.com, b@example.com"] {
            assert_eq!(
                Envelope::draft("sender@example.com", [raw], PayloadRef::new("x")),
                Err(EnvelopeError::InvalidAddress(raw.to_string())),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn submit_validates() {
        let mut empty = envelope(&[]);
        assert_eq!(
            empty.submit(100, SystemTime::now()),
            Err(EnvelopeError::EmptyRecipientSet)
        );

        let mut wide = envelope(&["a@example.com", "b@example.com", "c@example.com"]);
        assert_eq!(
            wide.submit(2, SystemTime::now()),
            Err(EnvelopeError::TooManyRecipients { count: 3, max: 2 })
        );

        let mut ok = envelope(&["a@example.com"]);
        ok.submit(100, SystemTime::now()).unwrap();
        assert_eq!(ok.compute_status(), MailStatus::Queued);
        assert_eq!(ok.submission_count(), 1);
        assert_eq!(
            ok.submit(100, SystemTime::now()),
            Err(EnvelopeError::AlreadySubmitted)
        );
    }

    #[test]
    fn partially_sent_stays_partial() {
        let mut envelope = envelope(&["a@example.com", "b@example.com", "c@example.com"]);
        envelope.submit(100, SystemTime::now()).unwrap();

        record(&mut envelope, "a@example.com", RecipientStatus::Sent);
        record(&mut envelope, "b@example.com", RecipientStatus::Deferred);
        record(&mut envelope, "c@example.com", RecipientStatus::Bounced);
        assert_eq!(envelope.compute_status(), MailStatus::PartiallySent);

        let later = SystemTime::now() + Duration::from_secs(600);
        envelope
            .entry_mut("b@example.com")
            .unwrap()
            .record_attempt(&outcome(RecipientStatus::Sent), later)
            .unwrap();
        assert_eq!(envelope.compute_status(), MailStatus::PartiallySent);
    }

    #[test]
    fn uniform_summaries() {
        let mut bounced = envelope(&["a@example.com", "b@example.com"]);
        bounced.submit(100, SystemTime::now()).unwrap();
        record(&mut bounced, "a@example.com", RecipientStatus::Bounced);
        record(&mut bounced, "b@example.com", RecipientStatus::Bounced);
        assert_eq!(bounced.compute_status(), MailStatus::Bounced);

        let mut blocked = envelope(&["a@example.com", "b@example.com"]);
        blocked.submit(100, SystemTime::now()).unwrap();
        record(&mut blocked, "a@example.com", RecipientStatus::Blocked);
        record(&mut blocked, "b@example.com", RecipientStatus::Blocked);
        assert_eq!(blocked.compute_status(), MailStatus::Blocked);

        let mut mixed = envelope(&["a@example.com", "b@example.com"]);
        mixed.submit(100, SystemTime::now()).unwrap();
        record(&mut mixed, "a@example.com", RecipientStatus::Blocked);
        record(&mut mixed, "b@example.com", RecipientStatus::Bounced);
        assert_eq!(mixed.compute_status(), MailStatus::Failed);

        let mut deferred = envelope(&["a@example.com", "b@example.com"]);
        deferred.submit(100, SystemTime::now()).unwrap();
        record(&mut deferred, "a@example.com", RecipientStatus::Deferred);
        record(&mut deferred, "b@example.com", RecipientStatus::Deferred);
        assert_eq!(deferred.compute_status(), MailStatus::Deferred);

        let mut pending = envelope(&["a@example.com", "b@example.com"]);
        pending.submit(100, SystemTime::now()).unwrap();
        record(&mut pending, "a@example.com", RecipientStatus::Pending);
        assert_eq!(pending.compute_status(), MailStatus::Pending);
    }

    #[test]
    fn exhausted_bounce_is_failed() {
        let mut envelope = envelope(&["a@example.com"]);
        envelope.submit(100, SystemTime::now()).unwrap();
        record(&mut envelope, "a@example.com", RecipientStatus::Deferred);
        envelope
            .entry_mut("a@example.com")
            .unwrap()
            .exhaust("exhausted retries")
            .unwrap();

        assert_eq!(envelope.compute_status(), MailStatus::Failed);

        assert_eq!(
            envelope.requeue_bounced(SystemTime::now()),
            Err(EnvelopeError::RetryNotAllowed(MailStatus::Failed))
        );
        assert_eq!(envelope.requeue_failed(SystemTime::now()), Ok(1));
        assert_eq!(envelope.compute_status(), MailStatus::Deferred);
        assert_eq!(envelope.submission_count(), 2);
    }

    #[test]
    fn requeue_bounced_only_when_bounced() {
        let mut envelope = envelope(&["a@example.com"]);
        envelope.submit(100, SystemTime::now()).unwrap();
        assert_eq!(
            envelope.requeue_bounced(SystemTime::now()),
            Err(EnvelopeError::RetryNotAllowed(MailStatus::Queued))
        );

        record(&mut envelope, "a@example.com", RecipientStatus::Bounced);
        assert_eq!(envelope.requeue_bounced(SystemTime::now()), Ok(1));
        assert!(envelope.has_dispatchable());
    }

    #[test]
    fn cancel_rules() {
        let mut draft = envelope(&["a@example.com"]);
        draft.cancel().unwrap();
        assert_eq!(draft.compute_status(), MailStatus::Cancelled);
        assert!(!draft.has_dispatchable());

        let mut partial = envelope(&["a@example.com", "b@example.com"]);
        partial.submit(100, SystemTime::now()).unwrap();
        record(&mut partial, "a@example.com", RecipientStatus::Sent);
        assert_eq!(
            partial.cancel(),
            Err(EnvelopeError::CancelNotAllowed(MailStatus::PartiallySent))
        );
        assert!(!partial.is_cancelled());
    }
}
