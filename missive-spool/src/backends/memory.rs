use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use missive_common::{Envelope, EnvelopeId};

use crate::{SpoolError, r#trait::BackingStore};

/// In-memory backing store
///
/// Envelopes live in a `HashMap` behind an `RwLock`. An optional capacity
/// bounds the number of distinct envelopes; replacing an existing envelope
/// never counts against it.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    envelopes: Arc<RwLock<HashMap<EnvelopeId, Envelope>>>,
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            envelopes: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Recovers from a poisoned lock rather than failing
    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn write(&self, envelope: &Envelope) -> crate::Result<()> {
        let mut envelopes = self.envelopes.write()?;

        if let Some(cap) = self.capacity
            && !envelopes.contains_key(&envelope.id())
            && envelopes.len() >= cap
        {
            return Err(SpoolError::Internal(format!(
                "Memory spool capacity exceeded: {}/{cap} envelopes",
                envelopes.len()
            )));
        }

        envelopes.insert(envelope.id(), envelope.clone());

        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<EnvelopeId>> {
        let mut ids: Vec<_> = self.envelopes.read()?.keys().copied().collect();
        ids.sort();

        Ok(ids)
    }

    async fn read(&self, id: &EnvelopeId) -> crate::Result<Envelope> {
        self.envelopes
            .read()?
            .get(id)
            .cloned()
            .ok_or(SpoolError::NotFound(*id))
    }

    async fn delete(&self, id: &EnvelopeId) -> crate::Result<()> {
        self.envelopes
            .write()?
            .remove(id)
            .ok_or(SpoolError::NotFound(*id))?;

        Ok(())
    }
}
