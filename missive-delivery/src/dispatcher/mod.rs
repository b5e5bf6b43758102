//! Dispatcher workers
//!
//! Each worker repeatedly claims the next eligible envelope, hands its due
//! recipients to a transfer agent and releases it back to the queue. Workers
//! only watch for shutdown while idle, so a transfer that has started always
//! runs to completion (or to its own timeout).

mod attempt;

use std::{sync::Arc, time::SystemTime};

use missive_common::{EnvelopeId, MailStatus, Signal, internal, tracing};
use missive_spool::BackingStore;
use tokio::{
    sync::broadcast::{self, error::TryRecvError},
    task::JoinSet,
};

use crate::{
    agent::AgentPool,
    config::DeliveryConfig,
    error::DeliveryError,
    events::Notifier,
    queue::{DeliveryQueue, Disposition},
    scheduler::RetryScheduler,
};

/// Summary of one dispatched envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub id: EnvelopeId,
    pub status: MailStatus,
    /// Where the envelope went after the attempt
    pub disposition: Disposition,
    /// Recipients handed to an agent in this attempt
    pub attempted: usize,
    /// Agent used, if one was available
    pub agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    queue: Arc<DeliveryQueue>,
    pool: Arc<AgentPool>,
    store: Arc<dyn BackingStore>,
    scheduler: Arc<RetryScheduler>,
    notifier: Notifier,
    config: Arc<DeliveryConfig>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(
        queue: Arc<DeliveryQueue>,
        pool: Arc<AgentPool>,
        store: Arc<dyn BackingStore>,
        scheduler: Arc<RetryScheduler>,
        notifier: Notifier,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        Self {
            queue,
            pool,
            store,
            scheduler,
            notifier,
            config,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    /// Dispatch the next eligible envelope, if there is one
    pub async fn dispatch_once(&self) -> Result<Option<Dispatched>, DeliveryError> {
        let Some(claim) = self.queue.claim_next(SystemTime::now()) else {
            return Ok(None);
        };

        self.process(claim, false).await.map(Some)
    }

    /// Dispatch a specific envelope now, including recipients whose retry
    /// time has not come yet
    pub async fn dispatch_envelope(&self, id: EnvelopeId) -> Result<Dispatched, DeliveryError> {
        let claim = self.queue.claim(id, SystemTime::now())?;
        self.process(claim, true).await
    }

    /// Run the configured number of workers until a shutdown signal arrives.
    ///
    /// In-flight transfers get `shutdown_timeout_secs` to finish; after that
    /// the workers are aborted and the affected envelopes are picked up from
    /// storage on the next start.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        let workers = self.config.workers.max(1);
        internal!(level = INFO, "Dispatcher starting with {workers} workers");

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let dispatcher = self.clone();
            let signal = shutdown.resubscribe();
            tasks.spawn(async move { dispatcher.work(worker, signal).await });
        }

        match shutdown.recv().await {
            Ok(signal) => internal!("Dispatcher received {signal:?}"),
            Err(err) => tracing::error!("Dispatcher shutdown channel error: {err}"),
        }

        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                in_flight = self.queue.in_flight(),
                "Shutdown timeout exceeded, remaining transfers will be retried on restart"
            );
            tasks.abort_all();
        } else {
            internal!(level = INFO, "All in-flight transfers completed");
        }

        internal!(level = INFO, "Dispatcher shutdown complete");
        Ok(())
    }

    async fn work(self, worker: usize, mut shutdown: broadcast::Receiver<Signal>) {
        let idle = self.config.dispatch_interval();

        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            match self.dispatch_once().await {
                Ok(Some(dispatched)) => {
                    tracing::debug!(
                        worker,
                        envelope_id = %dispatched.id,
                        status = %dispatched.status,
                        attempted = dispatched.attempted,
                        "Dispatched envelope"
                    );
                    continue;
                }
                Ok(None) => {}
                Err(err) => tracing::error!(worker, error = %err, "Dispatch failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(idle) => {}
                _ = shutdown.recv() => break,
            }
        }

        internal!("Dispatcher worker {worker} stopped");
    }
}
