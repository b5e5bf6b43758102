//! A single dispatch of a claimed envelope

use std::time::SystemTime;

use missive_common::{AttemptOutcome, Envelope, audit, internal, outgoing, tracing};

use super::{Dispatched, Dispatcher};
use crate::{
    error::{DeliveryError, TransferError},
    queue::{Claim, Disposition},
    transfer::{TransferAgent, TransferRequest},
};

enum Attempt {
    /// Nothing was due
    Skipped,
    /// No agent could take the envelope; attempt counters are untouched
    NoAgent,
    Transferred { agent: String, recipients: usize },
}

impl Dispatcher {
    /// Transfer the due recipients of a claimed envelope, then release,
    /// persist and announce the result. `force` ignores retry times.
    pub(super) async fn process(
        &self,
        mut claim: Claim,
        force: bool,
    ) -> Result<Dispatched, DeliveryError> {
        let id = claim.id();
        let now = claim.claimed_at();
        let before = claim.envelope().clone();

        self.apply_block_policy(claim.envelope_mut(), now);

        let targets: Vec<String> = claim
            .envelope()
            .entries()
            .iter()
            .filter(|entry| {
                entry.is_dispatchable() && (force || self.scheduler.is_due(entry, now))
            })
            .map(|entry| entry.recipient().to_string())
            .collect();

        let attempt = if targets.is_empty() {
            Attempt::Skipped
        } else {
            self.attempt(claim.envelope_mut(), targets, now).await
        };

        let cancelled = self.queue.apply_cancel_request(&mut claim);
        let disposition = if cancelled {
            Disposition::Terminal
        } else if matches!(attempt, Attempt::NoAgent) {
            let eligible_at = now + self.config.agent_retry_delay();
            claim.envelope_mut().set_next_attempt_at(Some(eligible_at));
            Disposition::Retry { eligible_at }
        } else {
            self.scheduler.schedule(claim.envelope_mut(), SystemTime::now())
        };

        // Written while still claimed, so no other writer can interleave
        let mut persisted = self.store.write(claim.envelope()).await;

        let released = self.queue.release(claim, disposition);
        if released.cancelled {
            persisted = self.store.write(&released.envelope).await;
        }
        if cancelled || released.cancelled {
            audit::log_mail_cancelled(&id, true);
        }

        self.notifier.publish_changes(&before, &released.envelope);
        persisted?;

        let (attempted, agent) = match attempt {
            Attempt::Transferred { agent, recipients } => (recipients, Some(agent)),
            Attempt::Skipped | Attempt::NoAgent => (0, None),
        };

        Ok(Dispatched {
            id,
            status: released.envelope.compute_status(),
            disposition: if released.cancelled {
                Disposition::Terminal
            } else {
                disposition
            },
            attempted,
            agent,
        })
    }

    /// Settle recipients the block policy refuses as `Blocked`, without
    /// spending an attempt
    fn apply_block_policy(&self, envelope: &mut Envelope, now: SystemTime) {
        let policy = &self.config.block;
        if policy.is_empty() {
            return;
        }

        let id = envelope.id();
        let sender = envelope.sender().to_string();
        let vetoed: Vec<(String, String)> = envelope
            .entries()
            .iter()
            .filter(|entry| entry.is_dispatchable())
            .filter_map(|entry| {
                policy
                    .blocks(&sender, entry.recipient())
                    .map(|reason| (entry.recipient().to_string(), reason))
            })
            .collect();

        let mut blocked = 0;
        for (recipient, reason) in vetoed {
            let recorded = envelope
                .entry_mut(&recipient)
                .and_then(|entry| entry.record_attempt(&AttemptOutcome::Blocked { reason }, now));

            match recorded {
                Ok(_) => blocked += 1,
                Err(err) => tracing::warn!(
                    envelope_id = %id,
                    recipient = %recipient,
                    error = %err,
                    "Could not block recipient"
                ),
            }
        }

        if blocked > 0 {
            internal!(level = INFO, "Blocked {blocked} recipient(s) of {id} by policy");
        }
    }

    async fn attempt(
        &self,
        envelope: &mut Envelope,
        targets: Vec<String>,
        now: SystemTime,
    ) -> Attempt {
        let id = envelope.id();

        let selected = match self.pool.select_agent(now) {
            Ok(selected) => selected,
            Err(err) => {
                tracing::warn!(
                    envelope_id = %id,
                    retry_in = ?self.config.agent_retry_delay(),
                    "{err}"
                );
                envelope.set_last_error(Some(err.to_string()));
                return Attempt::NoAgent;
            }
        };

        let agent = selected.agent;
        let recipients = targets.len();
        audit::log_transfer_attempt(&id, agent.id(), recipients);

        let batches = if agent.capabilities().batch {
            vec![targets]
        } else {
            targets.into_iter().map(|recipient| vec![recipient]).collect()
        };

        for batch in batches {
            let request = TransferRequest {
                envelope_id: id,
                sender: envelope.sender().to_string(),
                recipients: batch,
                payload: envelope.payload().clone(),
            };

            // Outcomes are stamped with the start of the call, so relay
            // confirmations raised while it was running still apply
            let started = SystemTime::now();
            let (outcomes, token) = self.transfer(agent.as_ref(), envelope, &request).await;

            for (recipient, outcome) in request.recipients.iter().zip(outcomes) {
                let recorded = envelope.entry_mut(recipient).and_then(|entry| {
                    let transition = entry.record_attempt(&outcome, started)?;
                    entry.record_handoff(agent.id(), token.as_deref());
                    Ok(transition)
                });

                if let Err(err) = recorded {
                    tracing::warn!(
                        envelope_id = %id,
                        recipient = %recipient,
                        error = %err,
                        "Ignoring transfer outcome"
                    );
                }
            }
        }

        Attempt::Transferred {
            agent: agent.id().to_string(),
            recipients,
        }
    }

    /// One call to the agent, resolved into an outcome per requested
    /// recipient (in request order) and the agent's tracking token, if any
    async fn transfer(
        &self,
        agent: &dyn TransferAgent,
        envelope: &mut Envelope,
        request: &TransferRequest,
    ) -> (Vec<AttemptOutcome>, Option<String>) {
        let timeout = self.config.transfer_timeout();
        outgoing!(
            "Transferring {} to {} recipient(s) via {}",
            request.envelope_id,
            request.recipients.len(),
            agent.id()
        );

        let result = tokio::time::timeout(timeout, agent.transfer(request))
            .await
            .unwrap_or(Err(TransferError::Timeout(timeout)));

        let at = SystemTime::now();

        match result {
            Ok(receipt) => {
                self.pool.report_outcome(agent.id(), true, at);
                envelope.set_last_error(None);

                let outcomes: Vec<AttemptOutcome> = request
                    .recipients
                    .iter()
                    .map(|recipient| {
                        receipt.outcome_for(recipient).cloned().unwrap_or_else(|| {
                            AttemptOutcome::Deferred {
                                response: format!("No reply from {} for this recipient", agent.id()),
                            }
                        })
                    })
                    .collect();

                (outcomes, receipt.token)
            }
            Err(err) => {
                tracing::warn!(
                    envelope_id = %request.envelope_id,
                    agent = %agent.id(),
                    error = %err,
                    "Transfer failed"
                );
                self.pool.report_outcome(agent.id(), !err.is_agent_failure(), at);
                envelope.set_last_error(Some(err.to_string()));

                let response = match &err {
                    TransferError::Rejected { response, .. } => response.clone(),
                    other => other.to_string(),
                };
                let outcome = if err.is_permanent() {
                    AttemptOutcome::Bounced { response }
                } else {
                    AttemptOutcome::Deferred { response }
                };

                (vec![outcome; request.recipients.len()], None)
            }
        }
    }
}
