#![allow(dead_code)] // Not every test binary uses every helper

pub mod mock_agent;
pub mod mock_feed;
pub mod slow_store;

use std::sync::Arc;

use missive_common::{Envelope, PayloadRef};
use missive_delivery::{DeliveryConfig, Job, MailService, TransferAgent, jobs};
use missive_spool::{BackingStore, MemoryBackingStore};
use tokio::sync::mpsc;

pub struct Harness {
    pub service: MailService,
    pub store: Arc<MemoryBackingStore>,
    pub jobs: mpsc::Receiver<Job>,
}

pub fn harness(agents: Vec<Arc<dyn TransferAgent>>, config: DeliveryConfig) -> Harness {
    harness_with_store(agents, config, Arc::new(MemoryBackingStore::new()))
}

pub fn harness_with_store(
    agents: Vec<Arc<dyn TransferAgent>>,
    config: DeliveryConfig,
    store: Arc<MemoryBackingStore>,
) -> Harness {
    let (sender, jobs) = jobs::channel(64);
    let service = MailService::new(
        config,
        Arc::clone(&store) as Arc<dyn BackingStore>,
        agents,
        sender,
    );

    Harness {
        service,
        store,
        jobs,
    }
}

pub fn draft(recipients: &[&str]) -> Envelope {
    Envelope::draft(
        "sender@example.com",
        recipients,
        PayloadRef::new("payload-1"),
    )
    .expect("valid draft")
}
