//! Error types for envelope persistence

use std::io;

use missive_common::EnvelopeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Envelope not found: {0}")]
    NotFound(EnvelopeId),

    #[error("Spool validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Lock poisoning, capacity limits
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The file name and the stored envelope disagree about the id
    #[error("Stored envelope {found} does not match {expected}")]
    Mismatch {
        expected: EnvelopeId,
        found: EnvelopeId,
    },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Spool path cannot contain '..' components: {0}")]
    ParentDir(String),

    #[error("Spool path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Spool path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

impl<T> From<std::sync::PoisonError<T>> for SpoolError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<bincode::error::EncodeError> for SpoolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for SpoolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let spool_err = SpoolError::from(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "access denied",
        ));

        assert!(matches!(spool_err, SpoolError::Io(_)));
        assert!(spool_err.to_string().contains("access denied"));
    }

    #[test]
    fn poisoned_lock_is_internal() {
        let lock = std::sync::Mutex::new(());
        let poisoned = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = lock.lock();
                    panic!("poison");
                })
                .join()
        });
        assert!(poisoned.is_err());

        let err = lock.lock().map(|_| ()).map_err(SpoolError::from);
        assert!(matches!(err, Err(SpoolError::Internal(_))));
    }
}
