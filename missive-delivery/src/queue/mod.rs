//! Delivery queue
//!
//! Holds every envelope that still has work to do. An envelope is in exactly
//! one of four places:
//!
//! - ready: ordered by eligibility time, then submission time, then id
//! - parked: waiting on relay confirmations; claimable by id, and by
//!   [`DeliveryQueue::claim_next`] only once its confirmation deadline passes
//! - in flight: moved out to the worker that claimed it
//! - reserved: not in memory, but a caller is rewriting its stored copy
//!
//! A single mutex guards all four. It is only held for map operations,
//! never across transfer or storage I/O.

pub mod retry;

use std::{
    collections::{BTreeSet, HashMap},
    time::SystemTime,
};

use missive_common::{Envelope, EnvelopeId, internal};
use parking_lot::Mutex;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    eligible_at: SystemTime,
    submitted_at: SystemTime,
    id: EnvelopeId,
}

impl ReadyKey {
    fn new(envelope: &Envelope, eligible_at: SystemTime) -> Self {
        Self {
            eligible_at,
            submitted_at: envelope.submitted_at().unwrap_or_else(|| envelope.created_at()),
            id: envelope.id(),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Ready { key: ReadyKey, envelope: Envelope },
    Parked { key: ReadyKey, envelope: Envelope },
    InFlight { snapshot: Envelope, cancel_requested: bool },
    Reserved,
}

impl Slot {
    const fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Ready { envelope, .. } | Self::Parked { envelope, .. } => Some(envelope),
            Self::InFlight { snapshot, .. } => Some(snapshot),
            Self::Reserved => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeSet<ReadyKey>,
    parked: BTreeSet<ReadyKey>,
    slots: HashMap<EnvelopeId, Slot>,
}

impl QueueState {
    fn insert_ready(&mut self, envelope: Envelope, eligible_at: SystemTime) {
        let key = ReadyKey::new(&envelope, eligible_at);
        self.ready.insert(key);
        self.slots.insert(key.id, Slot::Ready { key, envelope });
    }

    fn insert_parked(&mut self, envelope: Envelope, until: SystemTime) {
        let key = ReadyKey::new(&envelope, until);
        self.parked.insert(key);
        self.slots.insert(key.id, Slot::Parked { key, envelope });
    }

    /// Put a stored envelope where its ledger says it belongs
    fn place(&mut self, envelope: Envelope, now: SystemTime) -> bool {
        if envelope.submitted_at().is_none() || envelope.is_settled() {
            return false;
        }

        let at = envelope.next_attempt_at().unwrap_or(now);
        if envelope.has_dispatchable() {
            self.insert_ready(envelope, at);
        } else {
            self.insert_parked(envelope, at);
        }
        true
    }

    /// The ready or parked envelope that has been due the longest
    fn next_due(&self, now: SystemTime) -> Option<EnvelopeId> {
        [self.ready.first(), self.parked.first()]
            .into_iter()
            .flatten()
            .filter(|key| key.eligible_at <= now)
            .min()
            .map(|key| key.id)
    }

    fn take_claim(&mut self, id: EnvelopeId) -> Option<Envelope> {
        let slot = self.slots.remove(&id)?;
        let envelope = match slot {
            Slot::Ready { key, envelope } => {
                self.ready.remove(&key);
                envelope
            }
            Slot::Parked { key, envelope } => {
                self.parked.remove(&key);
                envelope
            }
            busy @ (Slot::InFlight { .. } | Slot::Reserved) => {
                self.slots.insert(id, busy);
                return None;
            }
        };

        self.slots.insert(
            id,
            Slot::InFlight {
                snapshot: envelope.clone(),
                cancel_requested: false,
            },
        );

        Some(envelope)
    }

    fn vacate(&mut self, id: EnvelopeId) {
        if matches!(self.slots.get(&id), Some(Slot::Reserved)) {
            self.slots.remove(&id);
        }
    }
}

/// Exclusive ownership of a claimed envelope
///
/// Must be handed back through [`DeliveryQueue::release`]; until then no
/// other caller can claim the same id.
#[derive(Debug)]
pub struct Claim {
    envelope: Envelope,
    claimed_at: SystemTime,
}

impl Claim {
    #[must_use]
    pub const fn id(&self) -> EnvelopeId {
        self.envelope.id()
    }

    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub const fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    #[must_use]
    pub const fn claimed_at(&self) -> SystemTime {
        self.claimed_at
    }
}

/// Exclusive right to rewrite an envelope that only exists in storage
///
/// While held, the id cannot be claimed, enqueued or reserved again.
/// Dropping it without placing an envelope frees the id.
#[derive(Debug)]
#[must_use]
pub struct Reservation<'a> {
    queue: &'a DeliveryQueue,
    id: EnvelopeId,
    held: bool,
}

impl Reservation<'_> {
    #[must_use]
    pub const fn id(&self) -> EnvelopeId {
        self.id
    }

    /// Hand the envelope to the ready set and give up the reservation
    pub fn enqueue(mut self, envelope: Envelope, eligible_at: SystemTime) -> bool {
        if envelope.id() != self.id {
            return false;
        }

        self.held = false;
        let mut state = self.queue.state.lock();
        state.vacate(self.id);
        state.insert_ready(envelope, eligible_at);
        true
    }

    /// Place the envelope as [`DeliveryQueue::restore`] would and give up
    /// the reservation
    pub fn restore(mut self, envelope: Envelope, now: SystemTime) -> bool {
        if envelope.id() != self.id {
            return false;
        }

        self.held = false;
        let mut state = self.queue.state.lock();
        state.vacate(self.id);
        state.place(envelope, now)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.queue.state.lock().vacate(self.id);
        }
    }
}

/// What to do with a claimed envelope once the worker is done with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing left to do; the queue lets go of it
    Terminal,
    /// Back into the ready set
    Retry { eligible_at: SystemTime },
    /// Waiting for a relay to confirm delivery, at most `until`
    AwaitConfirmation { until: SystemTime },
}

#[derive(Debug)]
pub struct Released {
    /// The envelope as it stands after release, for persistence
    pub envelope: Envelope,
    /// A cancellation requested while in flight was applied
    pub cancelled: bool,
}

/// Result of asking the queue to cancel an envelope
#[derive(Debug)]
pub enum CancelRequest {
    /// Cancelled and removed from the queue
    Cancelled(Envelope),
    /// In flight; the request will be applied on release if still allowed
    Deferred,
}

fn cancel_requested_in_flight(envelope: &mut Envelope) -> bool {
    let id = envelope.id();
    match envelope.cancel() {
        Ok(()) => true,
        Err(err) => {
            internal!(
                level = WARN,
                "Dropping cancellation of {id} requested during transfer: {err}"
            );
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an envelope to the ready set. Returns `false` if the id is
    /// already queued.
    pub fn enqueue(&self, envelope: Envelope, eligible_at: SystemTime) -> bool {
        let mut state = self.state.lock();
        if state.slots.contains_key(&envelope.id()) {
            return false;
        }

        state.insert_ready(envelope, eligible_at);
        true
    }

    /// Add an envelope that is only waiting on relay confirmations
    pub fn park(&self, envelope: Envelope, until: SystemTime) -> bool {
        let mut state = self.state.lock();
        if state.slots.contains_key(&envelope.id()) {
            return false;
        }

        state.insert_parked(envelope, until);
        true
    }

    /// Claim the envelope that has been eligible the longest, if any is
    /// eligible at `now`. Parked envelopes count once their confirmation
    /// deadline has passed.
    pub fn claim_next(&self, now: SystemTime) -> Option<Claim> {
        let mut state = self.state.lock();
        let id = state.next_due(now)?;

        let envelope = state.take_claim(id)?;
        Some(Claim {
            envelope,
            claimed_at: now,
        })
    }

    /// Claim a specific envelope regardless of its eligibility time
    pub fn claim(&self, id: EnvelopeId, now: SystemTime) -> Result<Claim, QueueError> {
        let mut state = self.state.lock();
        match state.slots.get(&id) {
            None => Err(QueueError::NotQueued(id)),
            Some(Slot::InFlight { .. }) => Err(QueueError::InFlight(id)),
            Some(Slot::Reserved) => Err(QueueError::Busy(id)),
            Some(_) => state
                .take_claim(id)
                .map(|envelope| Claim {
                    envelope,
                    claimed_at: now,
                })
                .ok_or(QueueError::InFlight(id)),
        }
    }

    /// Reserve an id that is not in the queue, so its stored copy can be
    /// read, changed and written back without racing other writers.
    pub fn reserve(&self, id: EnvelopeId) -> Result<Reservation<'_>, QueueError> {
        let mut state = self.state.lock();
        match state.slots.get(&id) {
            None => {
                state.slots.insert(id, Slot::Reserved);
                Ok(Reservation {
                    queue: self,
                    id,
                    held: true,
                })
            }
            Some(Slot::InFlight { .. }) => Err(QueueError::InFlight(id)),
            Some(Slot::Reserved) => Err(QueueError::Busy(id)),
            Some(_) => Err(QueueError::AlreadyQueued(id)),
        }
    }

    /// Apply a cancellation requested while `claim` was in flight, so it is
    /// part of what the worker persists. Returns whether the envelope is
    /// now cancelled.
    pub fn apply_cancel_request(&self, claim: &mut Claim) -> bool {
        let requested = match self.state.lock().slots.get_mut(&claim.id()) {
            Some(Slot::InFlight {
                cancel_requested, ..
            }) => std::mem::take(cancel_requested),
            _ => false,
        };

        requested && cancel_requested_in_flight(claim.envelope_mut())
    }

    /// Hand a claim back. A cancellation requested while the envelope was in
    /// flight is applied first, if the envelope still allows it.
    pub fn release(&self, claim: Claim, disposition: Disposition) -> Released {
        let Claim { mut envelope, .. } = claim;
        let id = envelope.id();

        let mut state = self.state.lock();
        let cancel_requested = matches!(
            state.slots.remove(&id),
            Some(Slot::InFlight {
                cancel_requested: true,
                ..
            })
        );

        if cancel_requested && cancel_requested_in_flight(&mut envelope) {
            return Released {
                envelope,
                cancelled: true,
            };
        }

        match disposition {
            Disposition::Terminal => {}
            Disposition::Retry { eligible_at } => state.insert_ready(envelope.clone(), eligible_at),
            Disposition::AwaitConfirmation { until } => {
                state.insert_parked(envelope.clone(), until);
            }
        }

        Released {
            envelope,
            cancelled: false,
        }
    }

    /// Cancel a queued envelope, or record the request if it is in flight
    pub fn request_cancel(&self, id: EnvelopeId) -> Result<CancelRequest, crate::DeliveryError> {
        let mut state = self.state.lock();

        match state.slots.get_mut(&id) {
            None => Err(QueueError::NotQueued(id).into()),
            Some(Slot::Reserved) => Err(QueueError::Busy(id).into()),
            Some(Slot::InFlight {
                snapshot,
                cancel_requested,
            }) => {
                // Reject early what release would refuse anyway
                snapshot.clone().cancel()?;
                *cancel_requested = true;
                Ok(CancelRequest::Deferred)
            }
            Some(Slot::Ready { envelope, .. } | Slot::Parked { envelope, .. }) => {
                let mut envelope = envelope.clone();
                envelope.cancel()?;

                match state.slots.remove(&id) {
                    Some(Slot::Ready { key, .. }) => {
                        state.ready.remove(&key);
                    }
                    Some(Slot::Parked { key, .. }) => {
                        state.parked.remove(&key);
                    }
                    _ => {}
                }

                Ok(CancelRequest::Cancelled(envelope))
            }
        }
    }

    /// Take an envelope out of the queue. In-flight and reserved envelopes
    /// stay put.
    pub fn remove(&self, id: EnvelopeId) -> Result<Envelope, QueueError> {
        let mut state = self.state.lock();
        match state.slots.remove(&id) {
            None => Err(QueueError::NotQueued(id)),
            Some(in_flight @ Slot::InFlight { .. }) => {
                state.slots.insert(id, in_flight);
                Err(QueueError::InFlight(id))
            }
            Some(Slot::Reserved) => {
                state.slots.insert(id, Slot::Reserved);
                Err(QueueError::Busy(id))
            }
            Some(Slot::Ready { key, envelope }) => {
                state.ready.remove(&key);
                Ok(envelope)
            }
            Some(Slot::Parked { key, envelope }) => {
                state.parked.remove(&key);
                Ok(envelope)
            }
        }
    }

    /// Copy of an envelope as last released (or as claimed, if in flight)
    #[must_use]
    pub fn snapshot(&self, id: EnvelopeId) -> Option<Envelope> {
        self.state
            .lock()
            .slots
            .get(&id)
            .and_then(Slot::envelope)
            .cloned()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<Envelope> {
        let mut envelopes: Vec<_> = self
            .state
            .lock()
            .slots
            .values()
            .filter_map(Slot::envelope)
            .cloned()
            .collect();
        envelopes.sort_by_key(Envelope::id);
        envelopes
    }

    #[must_use]
    pub fn contains(&self, id: EnvelopeId) -> bool {
        self.state
            .lock()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.envelope().is_some())
    }

    #[must_use]
    pub fn is_in_flight(&self, id: EnvelopeId) -> bool {
        matches!(
            self.state.lock().slots.get(&id),
            Some(Slot::InFlight { .. })
        )
    }

    /// Envelopes in the queue, in any state
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.envelope().is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::InFlight { .. }))
            .count()
    }

    /// Eligibility time of the next ready envelope
    #[must_use]
    pub fn next_eligible_at(&self) -> Option<SystemTime> {
        self.state.lock().ready.first().map(|key| key.eligible_at)
    }

    /// Put an envelope loaded from storage back where it belongs. Settled
    /// and unsubmitted envelopes are ignored.
    pub fn restore(&self, envelope: Envelope, now: SystemTime) -> bool {
        let mut state = self.state.lock();
        if state.slots.contains_key(&envelope.id()) {
            return false;
        }

        state.place(envelope, now)
    }
}
