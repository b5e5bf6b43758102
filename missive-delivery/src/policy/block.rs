//! Recipient and sender blocking
//!
//! Checked before an agent is chosen. A blocked recipient is settled as
//! `Blocked` and never handed to a relay.

use serde::Deserialize;

/// Addresses and domains mail must never be sent to or from
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockPolicy {
    /// Recipient domains. `example.com` also covers `mx.example.com`.
    #[serde(default)]
    pub blocked_domains: Vec<String>,

    /// Full sender addresses
    #[serde(default)]
    pub blocked_senders: Vec<String>,
}

impl BlockPolicy {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.blocked_domains.is_empty() && self.blocked_senders.is_empty()
    }

    /// Reason mail from `sender` to `recipient` is blocked, if it is
    #[must_use]
    pub fn blocks(&self, sender: &str, recipient: &str) -> Option<String> {
        if self
            .blocked_senders
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(sender))
        {
            return Some(format!("Sender {sender} is blocked"));
        }

        let domain = recipient.rsplit_once('@').map_or("", |(_, domain)| domain);
        self.blocked_domains
            .iter()
            .find(|blocked| covers(blocked, domain))
            .map(|blocked| format!("Recipient domain {blocked} is blocked"))
    }
}

fn covers(blocked: &str, domain: &str) -> bool {
    let blocked = blocked.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();

    domain == blocked
        || domain
            .strip_suffix(blocked.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}
