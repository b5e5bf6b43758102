//! Outbound notifications for whoever displays delivery state

use missive_common::{Envelope, EnvelopeId, MailStatus, RecipientStatus, audit, tracing};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    EnvelopeStatusChanged {
        id: EnvelopeId,
        from: MailStatus,
        to: MailStatus,
    },
    RecipientStatusChanged {
        id: EnvelopeId,
        recipient: String,
        from: RecipientStatus,
        to: RecipientStatus,
    },
    /// Every recipient of the envelope has been sent
    Delivered { id: EnvelopeId },
}

/// Fan-out of [`DeliveryEvent`]s to any number of subscribers
///
/// Emitting never blocks and never fails; events are dropped when nobody
/// is listening and lagging subscribers lose the oldest ones.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: DeliveryEvent) {
        tracing::trace!(?event, "Delivery event");
        let _ = self.sender.send(event);
    }

    /// Emit an event for every recipient and envelope status that differs
    /// between `before` and `after`, and write the matching audit records.
    pub fn publish_changes(&self, before: &Envelope, after: &Envelope) {
        let id = after.id();

        for entry in after.entries() {
            let previous = before
                .entry(entry.recipient())
                .map_or(RecipientStatus::Pending, |old| old.status());

            if previous == entry.status() {
                continue;
            }

            match entry.status() {
                RecipientStatus::Sent => audit::log_recipient_delivered(
                    &id,
                    entry.recipient(),
                    entry.attempts(),
                    entry.response().unwrap_or_default(),
                ),
                status @ (RecipientStatus::Bounced | RecipientStatus::Blocked) => {
                    audit::log_recipient_failed(
                        &id,
                        entry.recipient(),
                        status.as_str(),
                        entry.attempts(),
                        entry.response().unwrap_or_default(),
                    );
                }
                RecipientStatus::Pending | RecipientStatus::Deferred => {}
            }

            self.emit(DeliveryEvent::RecipientStatusChanged {
                id,
                recipient: entry.recipient().to_string(),
                from: previous,
                to: entry.status(),
            });
        }

        let from = before.compute_status();
        let to = after.compute_status();
        if from != to {
            self.emit(DeliveryEvent::EnvelopeStatusChanged { id, from, to });

            if to == MailStatus::Sent {
                self.emit(DeliveryEvent::Delivered { id });
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::SystemTime;

    use missive_common::{AttemptOutcome, PayloadRef};

    use super::*;

    #[test]
    fn publishes_differences_only() {
        let notifier = Notifier::new(16);
        let mut events = notifier.subscribe();

        let mut before = Envelope::draft(
            "sender@example.com",
            ["a@example.com", "b@example.com"],
            PayloadRef::new("blob"),
        )
        .unwrap();
        before.submit(100, SystemTime::now()).unwrap();

        let mut after = before.clone();
        for recipient in ["a@example.com", "b@example.com"] {
            after
                .entry_mut(recipient)
                .unwrap()
                .record_attempt(
                    &AttemptOutcome::Delivered {
                        response: "250 OK".to_string(),
                    },
                    SystemTime::now(),
                )
                .unwrap();
        }

        notifier.publish_changes(&before, &after);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        let id = after.id();
        assert_eq!(
            received,
            [
                DeliveryEvent::RecipientStatusChanged {
                    id,
                    recipient: "a@example.com".to_string(),
                    from: RecipientStatus::Pending,
                    to: RecipientStatus::Sent,
                },
                DeliveryEvent::RecipientStatusChanged {
                    id,
                    recipient: "b@example.com".to_string(),
                    from: RecipientStatus::Pending,
                    to: RecipientStatus::Sent,
                },
                DeliveryEvent::EnvelopeStatusChanged {
                    id,
                    from: MailStatus::Queued,
                    to: MailStatus::Sent,
                },
                DeliveryEvent::Delivered { id },
            ]
        );

        notifier.publish_changes(&after, &after);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn emitting_without_subscribers() {
        Notifier::default().emit(DeliveryEvent::Delivered {
            id: EnvelopeId::generate(),
        });
    }
}
