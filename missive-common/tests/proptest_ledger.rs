//! Property-based tests for the recipient ledger and derived envelope status

#![allow(clippy::expect_used)]

use std::time::{Duration, SystemTime};

use missive_common::{
    AttemptOutcome, Envelope, MailStatus, PayloadRef, RecipientEntry, RecipientStatus,
};
use proptest::prelude::*;

fn outcome_strategy() -> impl Strategy<Value = AttemptOutcome> {
    let code = prop_oneof![
        Just("250 OK"),
        Just("421 try later"),
        Just("451 greylisted"),
        Just("550 unknown user"),
    ];

    (0..5u8, code).prop_map(|(kind, code)| {
        let response = code.to_string();
        match kind {
            0 => AttemptOutcome::Accepted { response },
            1 => AttemptOutcome::Delivered { response },
            2 => AttemptOutcome::Deferred { response },
            3 => AttemptOutcome::Bounced { response },
            _ => AttemptOutcome::Blocked { reason: response },
        }
    })
}

fn at(offset: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset)
}

proptest! {
    #[test]
    fn terminal_entries_never_change(
        outcomes in prop::collection::vec((outcome_strategy(), 0..100u64), 1..20)
    ) {
        let mut entry = RecipientEntry::new("rcpt@example.com".to_string());
        let mut terminal: Option<RecipientEntry> = None;

        for (outcome, offset) in outcomes {
            let result = entry.record_attempt(&outcome, at(offset));

            if let Some(frozen) = &terminal {
                prop_assert_eq!(&entry, frozen);
            } else if result.is_ok() && entry.status().is_terminal() {
                terminal = Some(entry.clone());
            }
        }
    }

    #[test]
    fn replaying_an_outcome_is_idempotent(outcome in outcome_strategy(), offset in 0..100u64) {
        let mut once = RecipientEntry::new("rcpt@example.com".to_string());
        let _ = once.record_attempt(&outcome, at(offset));

        let mut twice = once.clone();
        let _ = twice.record_attempt(&outcome, at(offset));

        prop_assert_eq!(once, twice);
    }

    #[test]
    fn status_is_a_function_of_the_ledger(
        outcomes in prop::collection::vec(outcome_strategy(), 1..6)
    ) {
        let recipients: Vec<String> = (0..outcomes.len())
            .map(|i| format!("rcpt{i}@example.com"))
            .collect();

        #[allow(clippy::expect_used, reason = "generated addresses are valid")]
        let mut envelope = Envelope::draft("sender@example.com", &recipients, PayloadRef::new("blob"))
            .expect("valid draft");
        #[allow(clippy::expect_used, reason = "recipient count is below the limit")]
        envelope.submit(100, at(0)).expect("submit");

        for (recipient, outcome) in recipients.iter().zip(&outcomes) {
            #[allow(clippy::expect_used, reason = "recipient was added above")]
            let entry = envelope.entry_mut(recipient).expect("entry");
            let _ = entry.record_attempt(outcome, at(1));
        }

        let status = envelope.compute_status();
        prop_assert_eq!(status, envelope.clone().compute_status());

        let sent = envelope
            .entries()
            .iter()
            .filter(|entry| entry.status() == RecipientStatus::Sent)
            .count();
        if sent == recipients.len() {
            prop_assert_eq!(status, MailStatus::Sent);
        } else if sent > 0 {
            prop_assert_eq!(status, MailStatus::PartiallySent);
        } else {
            prop_assert!(!matches!(status, MailStatus::Sent | MailStatus::PartiallySent));
        }
    }
}
