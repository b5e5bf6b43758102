use async_trait::async_trait;
use missive_common::{Envelope, EnvelopeId};

/// Durable storage for envelopes and their ledgers
///
/// The delivery queue owns envelopes while they are in flight; the store is
/// where every state change is written so a restart can rebuild the queue.
/// Implementations must tolerate concurrent calls for different ids.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace the stored copy of an envelope
    async fn write(&self, envelope: &Envelope) -> crate::Result<()>;

    /// Ids of every stored envelope, oldest first
    async fn list(&self) -> crate::Result<Vec<EnvelopeId>>;

    async fn read(&self, id: &EnvelopeId) -> crate::Result<Envelope>;

    /// Remove an envelope permanently. Only called by retention policies.
    async fn delete(&self, id: &EnvelopeId) -> crate::Result<()>;
}
