//! In-memory store whose reads take a while, to widen race windows

use std::time::Duration;

use async_trait::async_trait;
use missive_common::{Envelope, EnvelopeId};
use missive_spool::{BackingStore, MemoryBackingStore};

#[derive(Debug)]
pub struct SlowStore {
    inner: MemoryBackingStore,
    read_delay: Duration,
}

impl SlowStore {
    pub fn new(read_delay: Duration) -> Self {
        Self {
            inner: MemoryBackingStore::new(),
            read_delay,
        }
    }
}

#[async_trait]
impl BackingStore for SlowStore {
    async fn write(&self, envelope: &Envelope) -> missive_spool::Result<()> {
        self.inner.write(envelope).await
    }

    async fn list(&self) -> missive_spool::Result<Vec<EnvelopeId>> {
        self.inner.list().await
    }

    async fn read(&self, id: &EnvelopeId) -> missive_spool::Result<Envelope> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.read(id).await
    }

    async fn delete(&self, id: &EnvelopeId) -> missive_spool::Result<()> {
        self.inner.delete(id).await
    }
}
