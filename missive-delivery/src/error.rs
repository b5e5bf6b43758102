//! Error taxonomy for the delivery pipeline
//!
//! - [`TransferError`]: what a transfer agent reports for a whole hand-off,
//!   split into temporary (retry) and permanent (bounce) failures
//! - [`AgentError`]: no agent could take the work right now
//! - [`QueueError`]: the envelope is not where the caller expected it
//! - [`DeliveryError`]: everything surfaced to callers of the pipeline

use std::time::Duration;

use missive_common::{EnvelopeError, EnvelopeId, LedgerError};
use missive_spool::SpoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("Envelope not found: {0}")]
    NotFound(EnvelopeId),

    #[error("Job channel closed")]
    JobChannelClosed,
}

impl DeliveryError {
    /// Whether the caller can expect the same request to succeed later
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Agent(_) | Self::Queue(QueueError::InFlight(_) | QueueError::Busy(_)) => true,
            Self::Transfer(err) => err.is_temporary(),
            _ => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("No transfer agent available")]
    NoAgentAvailable,
}

/// Failure of an entire transfer call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The agent could not be reached or dropped the connection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No answer within the transfer deadline
    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    /// The agent refused the envelope as a whole
    #[error("Envelope rejected: {response}")]
    Rejected { response: String, permanent: bool },
}

impl TransferError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        !self.is_permanent()
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { permanent: true, .. })
    }

    /// Whether the failure says something about the agent's health rather
    /// than about the envelope
    #[must_use]
    pub const fn is_agent_failure(&self) -> bool {
        !self.is_permanent()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Envelope {0} is not queued")]
    NotQueued(EnvelopeId),

    #[error("Envelope {0} is being transferred")]
    InFlight(EnvelopeId),

    #[error("Envelope {0} is already queued")]
    AlreadyQueued(EnvelopeId),

    #[error("Envelope {0} is being updated")]
    Busy(EnvelopeId),
}

/// A status feed could not be read
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Status feed error: {0}")]
pub struct FeedError(pub String);
