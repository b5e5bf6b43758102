//! The transfer protocol between the dispatcher and an outbound relay

use async_trait::async_trait;
use missive_common::{AttemptOutcome, EnvelopeId, PayloadRef};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    /// Accepts many recipients in one call
    #[serde(default)]
    pub batch: bool,

    /// Replies only mean "accepted"; final delivery is reported later
    /// through a status feed
    #[serde(default)]
    pub tracks_delivery: bool,
}

/// One hand-off to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    pub envelope_id: EnvelopeId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub payload: PayloadRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientReply {
    pub recipient: String,
    pub outcome: AttemptOutcome,
}

/// What an agent returned for a successful call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReceipt {
    pub replies: Vec<RecipientReply>,
    /// Receipt handle for polling delivery statuses
    pub token: Option<String>,
}

impl TransferReceipt {
    /// The reply for `recipient`, if the agent gave one
    #[must_use]
    pub fn outcome_for(&self, recipient: &str) -> Option<&AttemptOutcome> {
        self.replies
            .iter()
            .find(|reply| reply.recipient == recipient)
            .map(|reply| &reply.outcome)
    }
}

/// An outbound relay
#[async_trait]
pub trait TransferAgent: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities;

    /// Hand the message off. Returns per-recipient replies, or an error that
    /// applies to every recipient in the request.
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError>;
}

/// Classify an SMTP-style reply for one recipient.
///
/// 2xx is a successful hand-off (final delivery unless the agent tracks
/// delivery itself), 4xx is transient and 5xx permanent. Anything else is
/// treated as transient.
#[must_use]
pub fn classify_reply(code: u16, text: &str, tracks_delivery: bool) -> AttemptOutcome {
    let response = if text.is_empty() {
        code.to_string()
    } else {
        format!("{code} {text}")
    };

    match code {
        200..=299 if tracks_delivery => AttemptOutcome::Accepted { response },
        200..=299 => AttemptOutcome::Delivered { response },
        500..=599 => AttemptOutcome::Bounced { response },
        _ => AttemptOutcome::Deferred { response },
    }
}
