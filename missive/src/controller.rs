use std::sync::{Arc, LazyLock};

use missive_common::{Signal, audit, internal, logging};
use missive_delivery::{DeliveryConfig, Job, MailService, StatusFeed, TransferAgent, jobs};
use missive_spool::SpoolConfig;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

use crate::relay::{HttpRelay, RelayConfig};

const fn default_job_capacity() -> usize {
    1024
}

/// Root of `missive.config.ron`
#[derive(Debug, Deserialize)]
pub struct Missive {
    #[serde(default)]
    delivery: DeliveryConfig,

    #[serde(default)]
    spool: SpoolConfig,

    #[serde(default)]
    audit: audit::AuditConfig,

    #[serde(alias = "relay", default)]
    relays: Vec<RelayConfig>,

    /// Pending background jobs before submitters wait
    #[serde(default = "default_job_capacity")]
    job_capacity: usize,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Perform the background jobs the pipeline asks for
async fn consume_jobs(
    service: Arc<MailService>,
    mut jobs: mpsc::Receiver<Job>,
    feeds: Vec<Arc<dyn StatusFeed>>,
    mut shutdown: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(Job::TransferNow(id)) => match service.transfer_now(id).await {
                    Ok(dispatched) => tracing::debug!(
                        envelope_id = %id,
                        status = %dispatched.status,
                        "Transfer Now completed"
                    ),
                    // Already picked up by a worker, or finished before the job ran
                    Err(err) => tracing::debug!(envelope_id = %id, "Transfer Now skipped: {err}"),
                },
                Some(Job::FetchDeliveryStatuses) => {
                    for feed in &feeds {
                        let report = service.fetch_and_update_delivery_statuses(feed.as_ref()).await;
                        tracing::info!(
                            applied = report.applied,
                            stale = report.stale,
                            rejected = report.rejected,
                            held = report.held,
                            feed_failures = report.feed_failures,
                            "Delivery statuses reconciled"
                        );
                    }
                }
                None => break,
            },
            _ = shutdown.recv() => {
                internal!("Job consumer received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

/// Request a status reconciliation pass every `status_poll_interval_secs`
async fn poll_statuses(
    service: Arc<MailService>,
    mut shutdown: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    let period = service
        .config()
        .status_poll_interval()
        .max(std::time::Duration::from_secs(1));
    let mut timer = tokio::time::interval(period);

    // Skip the first tick to avoid immediate execution
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(err) = service.enqueue_fetch_and_update_delivery_statuses().await {
                    tracing::error!("Unable to request status reconciliation: {err}");
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    Ok(())
}

impl Missive {
    /// Run the delivery pipeline until shutdown
    ///
    /// # Errors
    ///
    /// This function will return an error if the spool or any relay fails
    /// to initialise.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        audit::init(self.audit);

        let store = self.spool.into_backing_store().await?;

        let relays = self
            .relays
            .into_iter()
            .map(|config| HttpRelay::new(config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        if relays.is_empty() {
            tracing::warn!("No relays configured, every envelope will be deferred");
        }

        let agents: Vec<Arc<dyn TransferAgent>> = relays
            .iter()
            .map(|relay| Arc::clone(relay) as Arc<dyn TransferAgent>)
            .collect();
        let feeds: Vec<Arc<dyn StatusFeed>> = relays
            .iter()
            .filter(|relay| relay.capabilities().tracks_delivery)
            .map(|relay| Arc::clone(relay) as Arc<dyn StatusFeed>)
            .collect();

        let (sender, receiver) = jobs::channel(self.job_capacity);
        let service = Arc::new(MailService::new(self.delivery, store, agents, sender));

        let restored = service.restore().await?;
        internal!(level = INFO, "Controller running with {restored} queued envelope(s)");

        let ret = tokio::select! {
            r = service.dispatcher().serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = consume_jobs(Arc::clone(&service), receiver, feeds, SHUTDOWN_BROADCAST.subscribe()) => {
                r
            }
            r = poll_statuses(Arc::clone(&service), SHUTDOWN_BROADCAST.subscribe()) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
