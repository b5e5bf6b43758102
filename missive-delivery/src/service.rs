//! Entry points for callers of the delivery pipeline
//!
//! [`MailService`] wires the queue, agent pool, dispatcher and reconciler
//! together over one backing store. Background work is never started here;
//! it is requested as a [`Job`] on the outbound job port.

use std::{collections::BTreeSet, sync::Arc, time::SystemTime};

use missive_common::{
    Envelope, EnvelopeError, EnvelopeId, MailStatus, RecipientEntry, RecipientStatus, audit,
    internal, tracing,
};
use missive_spool::{BackingStore, SpoolError};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    agent::{AgentHealth, AgentPool},
    config::DeliveryConfig,
    dispatcher::{Dispatched, Dispatcher},
    error::{DeliveryError, QueueError},
    events::{DeliveryEvent, Notifier},
    jobs::{Job, JobSender},
    queue::{CancelRequest, DeliveryQueue},
    reconciler::{ReconcileReport, Reconciler, StatusEvent, StatusFeed},
    scheduler::RetryScheduler,
    transfer::TransferAgent,
};

/// Read-only projection of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientView {
    pub recipient: String,
    pub status: RecipientStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<SystemTime>,
    pub response: Option<String>,
    pub in_transit: bool,
    pub exhausted: bool,
    /// Earlier outcomes replaced by manual retries
    pub superseded: usize,
}

impl From<&RecipientEntry> for RecipientView {
    fn from(entry: &RecipientEntry) -> Self {
        Self {
            recipient: entry.recipient().to_string(),
            status: entry.status(),
            attempts: entry.attempts(),
            last_attempt_at: entry.last_attempt_at(),
            response: entry.response().map(str::to_string),
            in_transit: entry.in_transit(),
            exhausted: entry.exhausted(),
            superseded: entry.superseded().len(),
        }
    }
}

/// Read-only projection of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeView {
    pub id: EnvelopeId,
    pub sender: String,
    pub status: MailStatus,
    pub recipients: Vec<RecipientView>,
    pub submission_count: u32,
    pub submitted_at: Option<SystemTime>,
    pub next_attempt_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl From<&Envelope> for EnvelopeView {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id(),
            sender: envelope.sender().to_string(),
            status: envelope.compute_status(),
            recipients: envelope.entries().iter().map(RecipientView::from).collect(),
            submission_count: envelope.submission_count(),
            submitted_at: envelope.submitted_at(),
            next_attempt_at: envelope.next_attempt_at(),
            last_error: envelope.last_error().map(str::to_string),
        }
    }
}

/// How a cancel request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The envelope is cancelled
    Cancelled,
    /// A worker holds the envelope; the cancel is applied when it is
    /// released, unless a recipient was sent in the meantime
    Requested,
}

#[derive(Debug)]
pub struct MailService {
    queue: Arc<DeliveryQueue>,
    store: Arc<dyn BackingStore>,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    notifier: Notifier,
    jobs: JobSender,
    config: Arc<DeliveryConfig>,
}

impl MailService {
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        store: Arc<dyn BackingStore>,
        agents: Vec<Arc<dyn TransferAgent>>,
        jobs: JobSender,
    ) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(DeliveryQueue::new());
        let pool = Arc::new(AgentPool::new(agents, config.agents.clone()));
        let scheduler = Arc::new(
            RetryScheduler::new(config.retry.clone())
                .with_confirmation_timeout(config.confirmation_timeout()),
        );
        let notifier = Notifier::new(config.event_capacity);

        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            pool,
            Arc::clone(&store),
            Arc::clone(&scheduler),
            notifier.clone(),
            Arc::clone(&config),
        );
        let reconciler = Reconciler::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            scheduler,
            notifier.clone(),
            Arc::clone(&config),
        );

        Self {
            queue,
            store,
            dispatcher,
            reconciler,
            notifier,
            jobs,
            config,
        }
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    #[must_use]
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.notifier.subscribe()
    }

    #[must_use]
    pub fn agent_health(&self) -> Vec<AgentHealth> {
        self.dispatcher.pool().health()
    }

    /// Submit a draft envelope for delivery and ask for an immediate
    /// transfer
    pub async fn submit_mail(&self, mut envelope: Envelope) -> Result<EnvelopeId, DeliveryError> {
        let now = SystemTime::now();
        let id = envelope.id();

        envelope.submit(self.config.max_recipients, now)?;
        self.store.write(&envelope).await?;

        let recipients: Vec<&str> = envelope
            .entries()
            .iter()
            .map(RecipientEntry::recipient)
            .collect();
        audit::log_mail_submitted(
            &id,
            envelope.sender(),
            &recipients,
            envelope.submission_count(),
        );

        self.queue.enqueue(envelope, now);
        self.notifier.emit(DeliveryEvent::EnvelopeStatusChanged {
            id,
            from: MailStatus::Draft,
            to: MailStatus::Queued,
        });

        self.request(Job::TransferNow(id)).await;
        Ok(id)
    }

    /// Transfer a queued envelope right away, ignoring retry times
    pub async fn transfer_now(&self, id: EnvelopeId) -> Result<Dispatched, DeliveryError> {
        match self.dispatcher.dispatch_envelope(id).await {
            Err(DeliveryError::Queue(QueueError::NotQueued(_))) => {
                let status = self.load(id).await?.compute_status();
                Err(EnvelopeError::RetryNotAllowed(status).into())
            }
            result => result,
        }
    }

    /// Give exhausted and blocked recipients of a `Failed` envelope a fresh
    /// retry budget
    pub async fn retry_failed(&self, id: EnvelopeId) -> Result<usize, DeliveryError> {
        self.requeue(id, Envelope::requeue_failed).await
    }

    /// Give the recipients of a `Bounced` envelope another chance
    pub async fn retry_bounced(&self, id: EnvelopeId) -> Result<usize, DeliveryError> {
        self.requeue(id, Envelope::requeue_bounced).await
    }

    async fn requeue<F>(&self, id: EnvelopeId, reopen: F) -> Result<usize, DeliveryError>
    where
        F: FnOnce(&mut Envelope, SystemTime) -> Result<usize, EnvelopeError>,
    {
        // Failed and bounced envelopes are settled, so never in the queue.
        // The reservation keeps a concurrent retry or reconciliation from
        // writing between our read and our write.
        let reservation = match self.queue.reserve(id) {
            Ok(reservation) => reservation,
            Err(err) => {
                return Err(match self.queue.snapshot(id) {
                    Some(queued) => EnvelopeError::RetryNotAllowed(queued.compute_status()).into(),
                    None => err.into(),
                });
            }
        };

        let now = SystemTime::now();
        let mut envelope = self.load(id).await?;
        let before = envelope.clone();

        let reopened = reopen(&mut envelope, now)?;
        self.store.write(&envelope).await?;

        let recipients: Vec<&str> = envelope
            .entries()
            .iter()
            .filter(|entry| entry.is_dispatchable())
            .map(RecipientEntry::recipient)
            .collect();
        audit::log_mail_submitted(
            &id,
            envelope.sender(),
            &recipients,
            envelope.submission_count(),
        );

        reservation.enqueue(envelope.clone(), now);
        self.notifier.publish_changes(&before, &envelope);

        internal!(level = INFO, "Re-opened {reopened} recipient(s) of {id}");
        self.request(Job::TransferNow(id)).await;

        Ok(reopened)
    }

    /// Cancel an envelope that has not been sent to anyone
    pub async fn cancel(&self, id: EnvelopeId) -> Result<Cancellation, DeliveryError> {
        let queued = self.queue.snapshot(id).map(|envelope| envelope.compute_status());

        let (from, envelope) = match self.queue.request_cancel(id) {
            Ok(CancelRequest::Cancelled(envelope)) => (queued.unwrap_or(MailStatus::Queued), envelope),
            Ok(CancelRequest::Deferred) => {
                internal!(level = INFO, "Cancellation of {id} will apply after the current transfer");
                return Ok(Cancellation::Requested);
            }
            Err(DeliveryError::Queue(QueueError::NotQueued(_))) => {
                let _reservation = self.queue.reserve(id)?;
                let mut envelope = self.load(id).await?;
                let from = envelope.compute_status();
                envelope.cancel()?;
                self.store.write(&envelope).await?;
                self.announce_cancel(id, from);
                return Ok(Cancellation::Cancelled);
            }
            Err(err) => return Err(err),
        };

        self.store.write(&envelope).await?;
        self.announce_cancel(id, from);

        Ok(Cancellation::Cancelled)
    }

    fn announce_cancel(&self, id: EnvelopeId, from: MailStatus) {
        audit::log_mail_cancelled(&id, false);
        self.notifier.emit(DeliveryEvent::EnvelopeStatusChanged {
            id,
            from,
            to: MailStatus::Cancelled,
        });
    }

    /// One reconciliation pass against `feed`
    pub async fn fetch_and_update_delivery_statuses(&self, feed: &dyn StatusFeed) -> ReconcileReport {
        self.reconciler.poll(feed).await
    }

    /// Ask the job consumer to run a reconciliation pass
    pub async fn enqueue_fetch_and_update_delivery_statuses(&self) -> Result<(), DeliveryError> {
        self.jobs.send(Job::FetchDeliveryStatuses).await
    }

    /// Merge statuses pushed by a relay
    pub async fn ingest_statuses(&self, events: Vec<StatusEvent>) -> ReconcileReport {
        self.reconciler.ingest(events).await
    }

    pub async fn status(&self, id: EnvelopeId) -> Result<MailStatus, DeliveryError> {
        Ok(self.load(id).await?.compute_status())
    }

    pub async fn ledger(&self, id: EnvelopeId) -> Result<Vec<RecipientView>, DeliveryError> {
        let envelope = self.load(id).await?;
        Ok(envelope.entries().iter().map(RecipientView::from).collect())
    }

    pub async fn view(&self, id: EnvelopeId) -> Result<EnvelopeView, DeliveryError> {
        Ok(EnvelopeView::from(&self.load(id).await?))
    }

    /// Every known envelope, optionally only those with the given status
    pub async fn list(&self, filter: Option<MailStatus>) -> Result<Vec<EnvelopeView>, DeliveryError> {
        let mut ids: BTreeSet<EnvelopeId> = self.store.list().await?.into_iter().collect();
        ids.extend(self.queue.snapshots().iter().map(Envelope::id));

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            let view = EnvelopeView::from(&self.load(id).await?);
            if filter.is_none_or(|status| status == view.status) {
                views.push(view);
            }
        }

        Ok(views)
    }

    /// Rebuild the queue from the backing store. Returns how many envelopes
    /// were queued again.
    pub async fn restore(&self) -> Result<usize, DeliveryError> {
        let now = SystemTime::now();
        let mut restored = 0;

        for id in self.store.list().await? {
            match self.store.read(&id).await {
                Ok(envelope) => {
                    if self.queue.restore(envelope, now) {
                        restored += 1;
                    }
                }
                Err(err) => {
                    tracing::error!(envelope_id = %id, error = %err, "Skipping unreadable envelope");
                }
            }
        }

        internal!(level = INFO, "Restored {restored} envelope(s) into the delivery queue");
        Ok(restored)
    }

    /// The freshest copy of an envelope: the queue's if it has one
    async fn load(&self, id: EnvelopeId) -> Result<Envelope, DeliveryError> {
        if let Some(envelope) = self.queue.snapshot(id) {
            return Ok(envelope);
        }

        self.store.read(&id).await.map_err(|err| match err {
            SpoolError::NotFound(_) => DeliveryError::NotFound(id),
            other => other.into(),
        })
    }

    async fn request(&self, job: Job) {
        if let Err(err) = self.jobs.send(job).await {
            tracing::warn!(?job, error = %err, "Unable to request background job");
        }
    }
}
