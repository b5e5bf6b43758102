//! Audit trail for the outgoing-mail lifecycle
//!
//! Each event is a single `tracing` event with an `event` field naming it, so
//! a JSON or log-shipping layer can route them separately from diagnostics.
//!
//! - `MailSubmitted`: envelope accepted into the delivery queue
//! - `TransferAttempt`: envelope handed to a transfer agent
//! - `RecipientDelivered`: a recipient reached `Sent`
//! - `RecipientFailed`: a recipient reached `Bounced` or `Blocked`
//! - `MailCancelled`: envelope withdrawn before any recipient was sent
//!
//! Addresses can be redacted through [`AuditConfig`].

use std::sync::{Arc, OnceLock};

use serde::Deserialize;

use crate::id::EnvelopeId;

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replace the local part of sender addresses with `[REDACTED]`
    #[serde(default)]
    pub redact_sender: bool,

    /// Replace the local part of recipient addresses with `[REDACTED]`
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_sender: false,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: OnceLock<Arc<AuditConfig>> = OnceLock::new();

/// Set the audit configuration. Only the first call has any effect.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    email
        .split_once('@')
        .map_or_else(|| "[REDACTED]".to_string(), |(_, domain)| format!("[REDACTED]@{domain}"))
}

#[must_use]
pub fn redact_emails<S: AsRef<str>>(emails: &[S], redact: bool) -> Vec<String> {
    emails
        .iter()
        .map(|email| redact_email(email.as_ref(), redact))
        .collect()
}

pub fn log_mail_submitted(id: &EnvelopeId, sender: &str, recipients: &[&str], submission: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "MailSubmitted",
        envelope_id = %id,
        sender = %redact_email(sender, config.redact_sender),
        recipients = ?redact_emails(recipients, config.redact_recipients),
        recipient_count = recipients.len(),
        submission,
        "Audit: Mail submitted for transfer"
    );
}

pub fn log_transfer_attempt(id: &EnvelopeId, agent: &str, recipients: usize) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "TransferAttempt",
        envelope_id = %id,
        agent = %agent,
        recipient_count = recipients,
        "Audit: Transfer attempt"
    );
}

pub fn log_recipient_delivered(id: &EnvelopeId, recipient: &str, attempts: u32, response: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "RecipientDelivered",
        envelope_id = %id,
        recipient = %redact_email(recipient, config.redact_recipients),
        attempts,
        response = %response,
        "Audit: Recipient delivered"
    );
}

pub fn log_recipient_failed(
    id: &EnvelopeId,
    recipient: &str,
    status: &str,
    attempts: u32,
    response: &str,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::WARN,
        event = "RecipientFailed",
        envelope_id = %id,
        recipient = %redact_email(recipient, config.redact_recipients),
        status = %status,
        attempts,
        response = %response,
        "Audit: Recipient failed"
    );
}

pub fn log_mail_cancelled(id: &EnvelopeId, deferred: bool) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "MailCancelled",
        envelope_id = %id,
        deferred,
        "Audit: Mail cancelled"
    );
}
