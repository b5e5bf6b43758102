use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery state of a single recipient
///
/// ```text
/// Pending ──┬──> Sent
///           ├──> Bounced
///           ├──> Blocked
///           └──> Deferred ──┬──> Sent
///                  ^        ├──> Bounced
///                  └────────┤──> Blocked
///                           └──> Deferred
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum RecipientStatus {
    Pending,
    Sent,
    Deferred,
    Bounced,
    Blocked,
}

impl RecipientStatus {
    /// `Sent`, `Bounced` and `Blocked` never change again without a manual override
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Bounced | Self::Blocked)
    }

    /// How final a status is. Used to order remote reports that carry the
    /// same timestamp.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Deferred => 1,
            Self::Sent | Self::Bounced | Self::Blocked => 2,
        }
    }

    /// The transition table of the recipient ledger
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending | Self::Deferred,
                Self::Sent | Self::Deferred | Self::Bounced | Self::Blocked
            )
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Sent => "Sent",
            Self::Deferred => "Deferred",
            Self::Bounced => "Bounced",
            Self::Blocked => "Blocked",
        }
    }
}

impl Display for RecipientStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// Overall status of an envelope as shown to consumers of the pipeline.
///
/// The spelling of each variant (including the space in `Partially Sent`) is
/// part of the external contract; status colourisers and list filters match
/// on these exact strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum MailStatus {
    Draft,
    Pending,
    Queued,
    Deferred,
    #[serde(rename = "Partially Sent")]
    PartiallySent,
    Sent,
    Blocked,
    Bounced,
    Failed,
    Cancelled,
}

impl MailStatus {
    pub const ALL: [Self; 10] = [
        Self::Draft,
        Self::Pending,
        Self::Queued,
        Self::Deferred,
        Self::PartiallySent,
        Self::Sent,
        Self::Blocked,
        Self::Bounced,
        Self::Failed,
        Self::Cancelled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Pending => "Pending",
            Self::Queued => "Queued",
            Self::Deferred => "Deferred",
            Self::PartiallySent => "Partially Sent",
            Self::Sent => "Sent",
            Self::Blocked => "Blocked",
            Self::Bounced => "Bounced",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl Display for MailStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown mail status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MailStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl From<RecipientStatus> for MailStatus {
    fn from(value: RecipientStatus) -> Self {
        match value {
            RecipientStatus::Pending => Self::Pending,
            RecipientStatus::Sent => Self::Sent,
            RecipientStatus::Deferred => Self::Deferred,
            RecipientStatus::Bounced => Self::Bounced,
            RecipientStatus::Blocked => Self::Blocked,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{MailStatus, RecipientStatus};

    #[test]
    fn vocabulary_is_verbatim() {
        let rendered: Vec<_> = MailStatus::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            [
                "Draft",
                "Pending",
                "Queued",
                "Deferred",
                "Partially Sent",
                "Sent",
                "Blocked",
                "Bounced",
                "Failed",
                "Cancelled"
            ]
        );

        for status in MailStatus::ALL {
            assert_eq!(status.as_str().parse::<MailStatus>(), Ok(status));
        }
        assert!("PartiallySent".parse::<MailStatus>().is_err());
    }

    #[test]
    fn transition_table() {
        use RecipientStatus::{Blocked, Bounced, Deferred, Pending, Sent};

        for from in [Pending, Deferred] {
            for to in [Sent, Deferred, Bounced, Blocked] {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
            assert!(!from.can_transition_to(Pending));
        }

        for from in [Sent, Bounced, Blocked] {
            assert!(from.is_terminal());
            for to in [Pending, Sent, Deferred, Bounced, Blocked] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn rank_orders_finality() {
        assert!(RecipientStatus::Sent.rank() > RecipientStatus::Deferred.rank());
        assert!(RecipientStatus::Bounced.rank() > RecipientStatus::Deferred.rank());
        assert!(RecipientStatus::Deferred.rank() > RecipientStatus::Pending.rank());
    }
}
