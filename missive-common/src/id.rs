use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for an envelope
///
/// Wraps a ULID, so ids sort by creation time. Serialized as the ULID's
/// canonical string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EnvelopeId(ulid::Ulid);

const SPOOL_EXTENSION: &str = ".bin";

impl EnvelopeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// The spool file name for this id
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}{SPOOL_EXTENSION}", self.0)
    }

    /// Inverse of [`EnvelopeId::filename`]. Anything else found in a spool
    /// directory, including temporary files and path tricks, yields `None`.
    pub fn from_filename(filename: &str) -> Option<Self> {
        filename
            .strip_suffix(SPOOL_EXTENSION)
            .filter(|stem| stem.chars().all(|c| c.is_ascii_alphanumeric()))
            .and_then(|stem| stem.parse().ok())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for EnvelopeId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

impl From<EnvelopeId> for String {
    fn from(id: EnvelopeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for EnvelopeId {
    type Error = ulid::DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
