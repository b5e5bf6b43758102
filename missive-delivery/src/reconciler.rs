//! Status reconciliation
//!
//! Relays that track delivery report final recipient statuses some time
//! after accepting a transfer, possibly out of order and more than once.
//! [`merge`] decides whether a report changes a ledger entry; the
//! [`Reconciler`] routes reports to their envelopes, whether queued,
//! in flight or only in storage.

use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use missive_common::{
    Envelope, EnvelopeId, RecipientEntry, RecipientStatus, audit, incoming, internal, tracing,
};
use missive_spool::{BackingStore, SpoolError};
use serde::{Deserialize, Serialize};

use crate::{
    config::DeliveryConfig,
    error::{FeedError, QueueError},
    events::Notifier,
    queue::{DeliveryQueue, Disposition},
    scheduler::RetryScheduler,
};

/// A delivery status reported by a relay for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub envelope_id: EnvelopeId,
    pub recipient: String,
    pub status: RecipientStatus,
    /// Remote reply code and text
    pub response: String,
    /// When the relay observed the status
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    Applied,
    /// Same status and response as already recorded
    Duplicate,
    /// The entry is terminal, or the status is not a legal transition
    Rejected,
    /// Older than what the entry already knows
    Stale,
}

/// Merge one event into a ledger entry.
///
/// Newer events win. Events carrying the same timestamp as the recorded
/// attempt only win if their status is more final. Terminal entries never
/// change.
pub fn merge(entry: &mut RecipientEntry, event: &StatusEvent) -> MergeResult {
    if entry.status() == event.status && entry.response() == Some(event.response.as_str()) {
        return MergeResult::Duplicate;
    }

    if entry.status().is_terminal() {
        incoming!(
            level = DEBUG,
            "Rejecting {} for terminal recipient {} of {}",
            event.status,
            event.recipient,
            event.envelope_id
        );
        return MergeResult::Rejected;
    }

    let last = entry.last_attempt_at();
    let newer = last.is_none_or(|last| event.at > last);
    let outranks = last == Some(event.at) && event.status.rank() > entry.status().rank();
    if !(newer || outranks) {
        return MergeResult::Stale;
    }

    match entry.settle(event.status, &event.response, event.at) {
        Ok(_) => MergeResult::Applied,
        Err(err) => {
            tracing::warn!(envelope_id = %event.envelope_id, error = %err, "Rejecting status event");
            MergeResult::Rejected
        }
    }
}

/// Recipients of one envelope handed to a relay under the same receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedEnvelope {
    pub id: EnvelopeId,
    /// Receipt token returned by the relay at transfer time
    pub token: Option<String>,
    pub recipients: Vec<String>,
}

/// Pull side of reconciliation
#[async_trait]
pub trait StatusFeed: Send + Sync + std::fmt::Debug {
    /// Id of the agent whose hand-offs this feed reports on
    fn agent(&self) -> &str;

    async fn fetch(&self, envelopes: &[TrackedEnvelope]) -> Result<Vec<StatusEvent>, FeedError>;
}

/// Every in-transit hand-off to `agent`, one entry per envelope and receipt
fn tracked_by(envelopes: Vec<Envelope>, agent: &str) -> Vec<TrackedEnvelope> {
    let mut tracked = Vec::new();

    for envelope in envelopes {
        let mut receipts: BTreeMap<Option<&str>, Vec<String>> = BTreeMap::new();
        for entry in envelope.entries().iter().filter(|entry| entry.in_transit()) {
            if let Some(handoff) = entry.handoff()
                && handoff.agent == agent
            {
                receipts
                    .entry(handoff.token.as_deref())
                    .or_default()
                    .push(entry.recipient().to_string());
            }
        }

        tracked.extend(receipts.into_iter().map(|(token, recipients)| TrackedEnvelope {
            id: envelope.id(),
            token: token.map(str::to_string),
            recipients,
        }));
    }

    tracked
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub stale: usize,
    /// Events kept for an in-flight envelope until the next pass
    pub held: usize,
    /// Events for envelopes or recipients that do not exist
    pub unknown: usize,
    /// Events dropped because their envelope could not be loaded or saved
    pub failed: usize,
    pub feed_failures: u32,
}

impl ReconcileReport {
    const fn count(&mut self, result: MergeResult) {
        match result {
            MergeResult::Applied => self.applied += 1,
            MergeResult::Duplicate => self.duplicates += 1,
            MergeResult::Rejected => self.rejected += 1,
            MergeResult::Stale => self.stale += 1,
        }
    }
}

#[derive(Debug)]
pub struct Reconciler {
    queue: Arc<DeliveryQueue>,
    store: Arc<dyn BackingStore>,
    scheduler: Arc<RetryScheduler>,
    notifier: Notifier,
    config: Arc<DeliveryConfig>,
    held: DashMap<EnvelopeId, Vec<StatusEvent>>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        queue: Arc<DeliveryQueue>,
        store: Arc<dyn BackingStore>,
        scheduler: Arc<RetryScheduler>,
        notifier: Notifier,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        Self {
            queue,
            store,
            scheduler,
            notifier,
            config,
            held: DashMap::new(),
        }
    }

    /// Events waiting for their envelope to come back from a worker
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.iter().map(|entry| entry.value().len()).sum()
    }

    /// Merge pushed events, together with any held from earlier passes
    pub async fn ingest(&self, events: Vec<StatusEvent>) -> ReconcileReport {
        let mut grouped: BTreeMap<EnvelopeId, Vec<StatusEvent>> = BTreeMap::new();

        let held: Vec<EnvelopeId> = self.held.iter().map(|entry| *entry.key()).collect();
        for id in held {
            if let Some((id, events)) = self.held.remove(&id) {
                grouped.entry(id).or_default().extend(events);
            }
        }

        for event in events {
            grouped.entry(event.envelope_id).or_default().push(event);
        }

        let mut report = ReconcileReport::default();
        for (id, mut events) in grouped {
            events.sort_by(|a, b| {
                a.at.cmp(&b.at)
                    .then_with(|| a.status.rank().cmp(&b.status.rank()))
            });
            self.reconcile(id, events, &mut report).await;
        }

        internal!(
            level = DEBUG,
            "Reconciled statuses: {} applied, {} duplicate, {} rejected, {} stale, {} held",
            report.applied,
            report.duplicates,
            report.rejected,
            report.stale,
            report.held
        );

        report
    }

    /// One pull pass: ask the feed about every hand-off to its agent, in
    /// batches, and merge whatever comes back
    #[tracing::instrument(level = "debug", skip_all, fields(agent = %feed.agent()))]
    pub async fn poll(&self, feed: &dyn StatusFeed) -> ReconcileReport {
        let awaiting: Vec<Envelope> = self
            .queue
            .snapshots()
            .into_iter()
            .filter(Envelope::awaiting_confirmation)
            .collect();
        let tracked = tracked_by(awaiting, feed.agent());

        let max_failures = self.config.status_feed_max_failures;
        let mut failures = 0;
        let mut events = Vec::new();

        'batches: for batch in tracked.chunks(self.config.status_batch_size.max(1)) {
            loop {
                match feed.fetch(batch).await {
                    Ok(fetched) => {
                        events.extend(fetched);
                        break;
                    }
                    Err(err) => {
                        failures += 1;
                        incoming!(
                            level = WARN,
                            "Status feed request failed ({failures}/{max_failures}): {err}"
                        );
                        if failures >= max_failures {
                            break 'batches;
                        }
                        tokio::time::sleep(self.config.status_feed_backoff(failures)).await;
                    }
                }
            }
        }

        let mut report = self.ingest(events).await;
        report.feed_failures = failures;
        report
    }

    async fn reconcile(&self, id: EnvelopeId, events: Vec<StatusEvent>, report: &mut ReconcileReport) {
        let now = SystemTime::now();

        match self.queue.claim(id, now) {
            Ok(mut claim) => {
                let before = claim.envelope().clone();
                let applied = merge_all(claim.envelope_mut(), &events, report);
                let cancelled = self.queue.apply_cancel_request(&mut claim);
                let disposition = if cancelled {
                    Disposition::Terminal
                } else {
                    self.scheduler.schedule(claim.envelope_mut(), now)
                };

                // Written while still claimed, so no other writer can interleave
                let changed = applied > 0 || cancelled;
                if changed {
                    self.persist(claim.envelope(), events.len(), report).await;
                }

                let released = self.queue.release(claim, disposition);
                if released.cancelled {
                    self.persist(&released.envelope, events.len(), report).await;
                }
                if cancelled || released.cancelled {
                    audit::log_mail_cancelled(&id, true);
                }
                if changed || released.cancelled {
                    self.notifier.publish_changes(&before, &released.envelope);
                }
            }
            Err(QueueError::NotQueued(_)) => self.reconcile_stored(id, events, now, report).await,
            Err(QueueError::InFlight(_) | QueueError::Busy(_) | QueueError::AlreadyQueued(_)) => {
                self.hold(id, events, report);
            }
        }
    }

    /// Merge into an envelope that only exists in storage. The id is
    /// reserved for the read-modify-write so a concurrent retry or cancel
    /// cannot overwrite the result.
    async fn reconcile_stored(
        &self,
        id: EnvelopeId,
        events: Vec<StatusEvent>,
        now: SystemTime,
        report: &mut ReconcileReport,
    ) {
        let Ok(reservation) = self.queue.reserve(id) else {
            self.hold(id, events, report);
            return;
        };

        match self.store.read(&id).await {
            Ok(mut envelope) => {
                let before = envelope.clone();
                if merge_all(&mut envelope, &events, report) == 0 {
                    return;
                }

                let disposition = self.scheduler.schedule(&mut envelope, now);
                self.persist(&envelope, events.len(), report).await;
                self.notifier.publish_changes(&before, &envelope);

                if disposition != Disposition::Terminal {
                    reservation.restore(envelope, now);
                }
            }
            Err(SpoolError::NotFound(_)) => {
                incoming!(level = WARN, "Status events for unknown envelope {id}");
                report.unknown += events.len();
            }
            Err(err) => {
                tracing::error!(envelope_id = %id, error = %err, "Unable to load envelope");
                report.failed += events.len();
            }
        }
    }

    fn hold(&self, id: EnvelopeId, events: Vec<StatusEvent>, report: &mut ReconcileReport) {
        report.held += events.len();
        self.held.entry(id).or_default().extend(events);
    }

    async fn persist(&self, envelope: &Envelope, events: usize, report: &mut ReconcileReport) {
        if let Err(err) = self.store.write(envelope).await {
            tracing::error!(envelope_id = %envelope.id(), error = %err, "Unable to persist envelope");
            report.failed += events;
        }
    }
}

/// Merge `events` (already in order) into `envelope`, returning how many
/// were applied
fn merge_all(envelope: &mut Envelope, events: &[StatusEvent], report: &mut ReconcileReport) -> usize {
    let mut applied = 0;

    for event in events {
        if envelope.is_cancelled() {
            report.rejected += 1;
            continue;
        }

        match envelope.entry_mut(&event.recipient) {
            Ok(entry) => {
                let result = merge(entry, event);
                if result == MergeResult::Applied {
                    applied += 1;
                }
                report.count(result);
            }
            Err(_) => report.unknown += 1,
        }
    }

    applied
}
