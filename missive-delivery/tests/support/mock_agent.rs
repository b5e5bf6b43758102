//! Scriptable transfer agent
//!
//! Replies are scripted per recipient as SMTP-style codes, consumed in
//! order; once a recipient's script runs out the default code is used.
//! Whole-call failures can be queued with [`MockAgent::fail_next`] or made
//! permanent with [`MockAgent::always_fail`]. Tracking agents hand out one
//! receipt per call: `receipt-0`, `receipt-1`, ...

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use missive_delivery::{
    AgentCapabilities, RecipientReply, TransferAgent, TransferError, TransferReceipt,
    TransferRequest, classify_reply,
};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct MockAgent {
    id: String,
    capabilities: AgentCapabilities,
    default_code: u16,
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
    failures: Mutex<VecDeque<TransferError>>,
    always_fail: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<TransferRequest>>,
}

impl MockAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: AgentCapabilities::default(),
            default_code: 250,
            scripts: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            always_fail: false,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn batching(mut self) -> Self {
        self.capabilities.batch = true;
        self
    }

    #[must_use]
    pub fn tracking(mut self) -> Self {
        self.capabilities.tracks_delivery = true;
        self
    }

    #[must_use]
    pub fn default_code(mut self, code: u16) -> Self {
        self.default_code = code;
        self
    }

    #[must_use]
    pub fn always_fail(mut self) -> Self {
        self.always_fail = true;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn reply(self, recipient: &str, codes: &[u16]) -> Self {
        self.scripts
            .lock()
            .insert(recipient.to_string(), codes.iter().copied().collect());
        self
    }

    pub fn fail_next(&self, error: TransferError) {
        self.failures.lock().push_back(error);
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn code_for(&self, recipient: &str) -> u16 {
        self.scripts
            .lock()
            .get_mut(recipient)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default_code)
    }
}

#[async_trait]
impl TransferAgent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.capabilities
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail {
            return Err(TransferError::Connection(format!("{} refused", self.id)));
        }

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let replies = request
            .recipients
            .iter()
            .map(|recipient| {
                let code = self.code_for(recipient);
                RecipientReply {
                    recipient: recipient.clone(),
                    outcome: classify_reply(code, "mock", self.capabilities.tracks_delivery),
                }
            })
            .collect();

        Ok(TransferReceipt {
            replies,
            token: self
                .capabilities
                .tracks_delivery
                .then(|| format!("receipt-{call}")),
        })
    }
}
