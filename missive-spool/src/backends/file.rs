use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use missive_common::{Envelope, EnvelopeId, internal};
use tokio::fs;

use crate::{SerializationError, SpoolError, ValidationError, r#trait::BackingStore};

const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// File-based backing store
///
/// Each envelope is a single bincode file named `{ulid}.bin`. Writes go to
/// `.tmp_{ulid}.bin` first and are renamed into place, so a reader never sees
/// a partially written envelope. Deletes rename to `{ulid}.bin.deleted`
/// before unlinking; leftovers of either kind are removed by [`Self::init`].
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/missive"),
        }
    }
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

impl FileBackingStore {
    /// Validate `path` and build a store over it. Nothing is touched on disk
    /// until [`Self::init`].
    pub fn new(path: PathBuf) -> Result<Self, ValidationError> {
        Self::validate_path(&path)?;
        Ok(Self { path })
    }

    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDir(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn envelope_path(&self, id: &EnvelopeId) -> PathBuf {
        self.path.join(id.filename())
    }

    /// Create the spool directory if needed and clear out files left behind
    /// by interrupted writes or deletes.
    pub async fn init(&self) -> crate::Result<()> {
        internal!("Initialising spool at {}", self.path.display());

        match fs::metadata(&self.path).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                internal!("{} does not exist, creating...", self.path.display());
                fs::create_dir_all(&self.path).await?;
            }
            Err(err) => return Err(err.into()),
        }

        let mut entries = fs::read_dir(&self.path).await?;
        let mut cleaned = 0;

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(TEMP_PREFIX) || filename.ends_with(DELETED_SUFFIX) {
                fs::remove_file(entry.path()).await?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from spool"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    #[tracing::instrument(level = "debug", skip(self, envelope), fields(id = %envelope.id()))]
    async fn write(&self, envelope: &Envelope) -> crate::Result<()> {
        let id = envelope.id();
        let target = self.envelope_path(&id);
        let temp = self.path.join(format!("{TEMP_PREFIX}{}", id.filename()));

        let encoded = bincode::serde::encode_to_vec(envelope, bincode_config())?;
        fs::write(&temp, &encoded).await?;
        fs::rename(&temp, &target).await?;

        internal!(level = DEBUG, "Spooled envelope {id} to {}", target.display());

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self) -> crate::Result<Vec<EnvelopeId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if !filename.starts_with(TEMP_PREFIX)
                && let Some(id) = EnvelopeId::from_filename(&filename)
            {
                ids.push(id);
            }
        }

        ids.sort();

        internal!(level = DEBUG, "Found {} envelopes in spool", ids.len());

        Ok(ids)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    async fn read(&self, id: &EnvelopeId) -> crate::Result<Envelope> {
        let bytes = match fs::read(self.envelope_path(id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(*id));
            }
            Err(err) => return Err(err.into()),
        };

        let (envelope, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode_config())?;

        if envelope.id() != *id {
            return Err(SerializationError::Mismatch {
                expected: *id,
                found: envelope.id(),
            }
            .into());
        }

        Ok(envelope)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    async fn delete(&self, id: &EnvelopeId) -> crate::Result<()> {
        let path = self.envelope_path(id);
        let deleted = self.path.join(format!("{}{DELETED_SUFFIX}", id.filename()));

        match fs::rename(&path, &deleted).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(*id));
            }
            Err(err) => return Err(err.into()),
        }

        fs::remove_file(&deleted).await?;

        internal!(level = DEBUG, "Deleted envelope {id} from spool");

        Ok(())
    }
}
