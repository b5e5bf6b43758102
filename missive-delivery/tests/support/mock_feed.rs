//! Status feed that serves canned events

use std::collections::VecDeque;

use async_trait::async_trait;
use missive_delivery::{FeedError, StatusEvent, StatusFeed, TrackedEnvelope};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct MockFeed {
    agent: String,
    events: Mutex<Vec<StatusEvent>>,
    failures: Mutex<VecDeque<FeedError>>,
    requests: Mutex<Vec<Vec<TrackedEnvelope>>>,
}

impl MockFeed {
    /// A feed reporting on hand-offs to `agent`
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            events: Mutex::default(),
            failures: Mutex::default(),
            requests: Mutex::default(),
        }
    }

    /// Served to the first request that asks about the event's recipient
    pub fn push(&self, event: StatusEvent) {
        self.events.lock().push(event);
    }

    pub fn fail_next(&self, times: usize) {
        let mut failures = self.failures.lock();
        for attempt in 0..times {
            failures.push_back(FeedError(format!("feed unavailable ({attempt})")));
        }
    }

    pub fn requests(&self) -> Vec<Vec<TrackedEnvelope>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StatusFeed for MockFeed {
    fn agent(&self) -> &str {
        &self.agent
    }

    async fn fetch(&self, envelopes: &[TrackedEnvelope]) -> Result<Vec<StatusEvent>, FeedError> {
        self.requests.lock().push(envelopes.to_vec());

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let mut events = self.events.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = events.drain(..).partition(|event| {
            envelopes.iter().any(|tracked| {
                tracked.id == event.envelope_id && tracked.recipients.contains(&event.recipient)
            })
        });
        *events = rest;

        Ok(matching)
    }
}
