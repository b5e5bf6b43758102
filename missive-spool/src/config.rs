use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{FileBackingStore, MemoryBackingStore, r#trait::BackingStore};

/// Which backing store to persist envelopes in
///
/// ```ron
/// spool: File(path: "/var/spool/missive"),
/// ```
///
/// ```ron
/// spool: Memory(capacity: Some(1000)),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum SpoolConfig {
    File {
        path: PathBuf,
    },
    Memory {
        /// Maximum number of envelopes held (omit for unlimited)
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::File {
            path: FileBackingStore::default().path().to_path_buf(),
        }
    }
}

impl SpoolConfig {
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Build the configured store. The file backend validates its path and
    /// prepares the spool directory.
    pub async fn into_backing_store(self) -> crate::Result<Arc<dyn BackingStore>> {
        match self {
            Self::File { path } => {
                let store = FileBackingStore::new(path)?;
                store.init().await?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity } => Ok(capacity.map_or_else(
                || Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
                |capacity| Arc::new(MemoryBackingStore::with_capacity(capacity)),
            )),
        }
    }
}
