//! Background work requested by the pipeline
//!
//! The pipeline never runs background work itself; it sends a [`Job`] and
//! whoever owns the receiving end (the runtime controller) performs it.

use missive_common::EnvelopeId;
use tokio::sync::mpsc;

use crate::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Dispatch this envelope now instead of waiting for a worker
    TransferNow(EnvelopeId),
    /// Run one status reconciliation pass
    FetchDeliveryStatuses,
}

#[derive(Debug, Clone)]
pub struct JobSender {
    sender: mpsc::Sender<Job>,
}

/// A bounded job channel
#[must_use]
pub fn channel(capacity: usize) -> (JobSender, mpsc::Receiver<Job>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (JobSender { sender }, receiver)
}

impl JobSender {
    pub async fn send(&self, job: Job) -> Result<(), DeliveryError> {
        self.sender
            .send(job)
            .await
            .map_err(|_| DeliveryError::JobChannelClosed)
    }
}
