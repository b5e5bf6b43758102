//! HTTP relay agent
//!
//! Speaks a small JSON protocol to an outbound relay:
//!
//! - `POST {url}/transfer` with a [`TransferRequest`], answered by one SMTP
//!   style reply per recipient and an optional receipt token
//! - `POST {url}/statuses` with the tracked envelopes, answered by the
//!   delivery statuses the relay has observed since

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use missive_common::{EnvelopeId, RecipientStatus, outgoing};
use missive_delivery::{
    AgentCapabilities, FeedError, RecipientReply, StatusEvent, StatusFeed, TrackedEnvelope,
    TransferAgent, TransferError, TransferReceipt, TransferRequest, classify_reply,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub id: String,

    /// Base URL of the relay's API
    pub url: String,

    /// Sent as a bearer token when present
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub capabilities: AgentCapabilities,

    /// Per-request HTTP timeout, on top of the dispatcher's transfer deadline
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid relay URL {url}: must be http(s)")]
    InvalidUrl { url: String },

    #[error("Unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct WireReply {
    recipient: String,
    code: u16,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireReceipt {
    replies: Vec<WireReply>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireStatusRequest<'a> {
    envelopes: &'a [TrackedEnvelope],
}

#[derive(Debug, Deserialize)]
struct WireStatusEvent {
    envelope_id: EnvelopeId,
    recipient: String,
    status: RecipientStatus,
    code: u16,
    #[serde(default)]
    text: String,
    /// Milliseconds since the epoch
    at_ms: u64,
}

#[derive(Debug, Deserialize)]
struct WireStatuses {
    events: Vec<WireStatusEvent>,
}

impl From<WireStatusEvent> for StatusEvent {
    fn from(event: WireStatusEvent) -> Self {
        let response = if event.text.is_empty() {
            event.code.to_string()
        } else {
            format!("{} {}", event.code, event.text)
        };

        Self {
            envelope_id: event.envelope_id,
            recipient: event.recipient,
            status: event.status,
            response,
            at: SystemTime::UNIX_EPOCH + Duration::from_millis(event.at_ms),
        }
    }
}

/// Map an HTTP-level failure to what it means for the envelope
fn classify_status(status: StatusCode, body: &str) -> TransferError {
    let response = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    TransferError::Rejected {
        response,
        permanent: status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS,
    }
}

pub struct HttpRelay {
    config: RelayConfig,
    client: reqwest::Client,
}

impl fmt::Debug for HttpRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRelay")
            .field("id", &self.config.id)
            .field("url", &self.config.url)
            .field("capabilities", &self.config.capabilities)
            .finish_non_exhaustive()
    }
}

impl HttpRelay {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(RelayError::InvalidUrl { url: config.url });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.url.trim_end_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(self.endpoint(path));
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl TransferAgent for HttpRelay {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.config.capabilities
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        outgoing!(
            level = DEBUG,
            "POST {} for {}",
            self.endpoint("transfer"),
            request.envelope_id
        );

        let response = self
            .post("transfer")
            .json(request)
            .send()
            .await
            .map_err(|err| TransferError::Connection(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let receipt: WireReceipt = response
            .json()
            .await
            .map_err(|err| TransferError::Connection(format!("Malformed relay reply: {err}")))?;

        let tracks_delivery = self.config.capabilities.tracks_delivery;
        Ok(TransferReceipt {
            replies: receipt
                .replies
                .into_iter()
                .map(|reply| RecipientReply {
                    outcome: classify_reply(reply.code, &reply.text, tracks_delivery),
                    recipient: reply.recipient,
                })
                .collect(),
            token: receipt.token,
        })
    }
}

#[async_trait]
impl StatusFeed for HttpRelay {
    fn agent(&self) -> &str {
        &self.config.id
    }

    async fn fetch(&self, envelopes: &[TrackedEnvelope]) -> Result<Vec<StatusEvent>, FeedError> {
        let response = self
            .post("statuses")
            .json(&WireStatusRequest { envelopes })
            .send()
            .await
            .map_err(|err| FeedError(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError(format!("{} answered {status}", self.config.id)));
        }

        let statuses: WireStatuses = response
            .json()
            .await
            .map_err(|err| FeedError(format!("Malformed status reply: {err}")))?;

        tracing::debug!(
            relay = %self.config.id,
            events = statuses.events.len(),
            "Fetched delivery statuses"
        );

        Ok(statuses.events.into_iter().map(StatusEvent::from).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(url: &str) -> RelayConfig {
        ron::from_str(&format!(
            "(id: \"relay-1\", url: \"{url}\", capabilities: (batch: true))"
        ))
        .unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = config("https://relay.example.com/api/");

        assert_eq!(config.timeout_secs, 30);
        assert!(config.token.is_none());
        assert!(config.capabilities.batch);
        assert!(!config.capabilities.tracks_delivery);
    }

    #[test]
    fn endpoints_join_cleanly() {
        let relay = HttpRelay::new(config("https://relay.example.com/api/")).unwrap();

        assert_eq!(
            relay.endpoint("transfer"),
            "https://relay.example.com/api/transfer"
        );
        assert_eq!(relay.id(), "relay-1");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            HttpRelay::new(config("smtp://relay.example.com")),
            Err(RelayError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn http_status_classification() {
        let permanent = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad sender");
        assert!(permanent.is_permanent());

        let throttled = classify_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(throttled.is_temporary());

        let unavailable = classify_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(unavailable.is_temporary());
    }

    #[test]
    fn wire_events_keep_code_and_time() {
        let event = StatusEvent::from(WireStatusEvent {
            envelope_id: EnvelopeId::generate(),
            recipient: "rcpt@example.com".to_string(),
            status: RecipientStatus::Sent,
            code: 250,
            text: "delivered".to_string(),
            at_ms: 1_700_000_000_123,
        });

        assert_eq!(event.response, "250 delivered");
        assert_eq!(
            event.at,
            SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)
        );
    }
}
