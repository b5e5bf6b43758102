pub mod audit;
pub mod envelope;
pub mod id;
pub mod ledger;
pub mod logging;
pub mod status;

pub use tracing;

pub use envelope::{Envelope, EnvelopeError, PayloadRef};
pub use id::EnvelopeId;
pub use ledger::{AttemptOutcome, Handoff, LedgerError, RecipientEntry, Transition};
pub use status::{MailStatus, RecipientStatus};

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
