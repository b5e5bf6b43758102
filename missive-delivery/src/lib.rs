//! Delivery pipeline for outgoing mail
//!
//! Envelopes are submitted through [`MailService`], held in the
//! [`DeliveryQueue`] and handed to relays by [`Dispatcher`] workers. Relay
//! confirmations are merged back by the [`Reconciler`] and the
//! [`RetryScheduler`] decides when deferred recipients are tried again.

pub mod agent;
mod config;
pub mod dispatcher;
mod error;
pub mod events;
pub mod jobs;
pub mod policy;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
mod service;
pub mod transfer;

pub use agent::{AgentHealth, AgentPool, AgentPoolConfig};
pub use config::DeliveryConfig;
pub use dispatcher::{Dispatched, Dispatcher};
pub use error::{AgentError, DeliveryError, FeedError, QueueError, TransferError};
pub use events::{DeliveryEvent, Notifier};
pub use jobs::{Job, JobSender};
pub use policy::{BlockPolicy, RetryPolicy};
pub use queue::{DeliveryQueue, Disposition, Reservation};
pub use reconciler::{MergeResult, ReconcileReport, Reconciler, StatusEvent, StatusFeed, TrackedEnvelope};
pub use scheduler::RetryScheduler;
pub use service::{Cancellation, EnvelopeView, MailService, RecipientView};
pub use transfer::{
    AgentCapabilities, RecipientReply, TransferAgent, TransferReceipt, TransferRequest,
    classify_reply,
};
