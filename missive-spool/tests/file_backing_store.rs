#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{path::PathBuf, time::SystemTime};

use missive_common::{AttemptOutcome, Envelope, PayloadRef, RecipientStatus};
use missive_spool::{BackingStore, FileBackingStore, SpoolError, ValidationError};

fn envelope(recipients: &[&str]) -> Envelope {
    Envelope::draft("sender@example.com", recipients, PayloadRef::new("blob://1")).unwrap()
}

async fn store() -> (tempfile::TempDir, FileBackingStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileBackingStore::new(dir.path().join("spool")).expect("valid path");
    store.init().await.expect("init");
    (dir, store)
}

#[test]
fn path_validation() {
    assert!(matches!(
        FileBackingStore::new(PathBuf::from("/var/spool/../etc/passwd")),
        Err(ValidationError::ParentDir(_))
    ));
    assert!(matches!(
        FileBackingStore::new(PathBuf::from("relative/path")),
        Err(ValidationError::NotAbsolute(_))
    ));

    for path in ["/etc/spool", "/bin/messages", "/proc/mail", "/dev/spool"] {
        let err = FileBackingStore::new(PathBuf::from(path)).unwrap_err();
        assert!(
            err.to_string().contains("system directory"),
            "Wrong error for path {path}"
        );
    }
}

#[tokio::test]
async fn ledger_survives_round_trip_through_disk() {
    let (_dir, store) = store().await;

    let mut envelope = envelope(&["a@example.com", "b@example.com"]);
    envelope.submit(100, SystemTime::now()).unwrap();
    envelope
        .entry_mut("a@example.com")
        .unwrap()
        .record_attempt(
            &AttemptOutcome::Deferred {
                response: "421 try later".to_string(),
            },
            SystemTime::now(),
        )
        .unwrap();
    let tracked = envelope.entry_mut("b@example.com").unwrap();
    tracked
        .record_attempt(
            &AttemptOutcome::Accepted {
                response: "250 queued".to_string(),
            },
            SystemTime::now(),
        )
        .unwrap();
    tracked.record_handoff("relay-1", Some("token-123"));

    store.write(&envelope).await.expect("write");

    let read = store.read(&envelope.id()).await.expect("read");
    assert_eq!(read, envelope);
    assert_eq!(
        read.entry("a@example.com").unwrap().status(),
        RecipientStatus::Deferred
    );
    assert_eq!(
        read.entry("b@example.com")
            .and_then(|entry| entry.handoff())
            .and_then(|handoff| handoff.token.as_deref()),
        Some("token-123")
    );
}

#[tokio::test]
async fn list_is_sorted_and_skips_foreign_files() {
    let (dir, store) = store().await;

    let first = envelope(&["a@example.com"]);
    let second = envelope(&["b@example.com"]);
    store.write(&second).await.unwrap();
    store.write(&first).await.unwrap();

    let spool = dir.path().join("spool");
    tokio::fs::write(spool.join("notes.txt"), b"hello").await.unwrap();
    tokio::fs::write(spool.join("not-a-ulid.bin"), b"junk").await.unwrap();

    let mut expected = vec![first.id(), second.id()];
    expected.sort();
    assert_eq!(store.list().await.unwrap(), expected);
}

#[tokio::test]
async fn delete_and_missing() {
    let (_dir, store) = store().await;
    let envelope = envelope(&["a@example.com"]);

    store.write(&envelope).await.unwrap();
    store.delete(&envelope.id()).await.unwrap();

    assert!(store.list().await.unwrap().is_empty());
    assert!(matches!(
        store.read(&envelope.id()).await,
        Err(SpoolError::NotFound(id)) if id == envelope.id()
    ));
    assert!(matches!(
        store.delete(&envelope.id()).await,
        Err(SpoolError::NotFound(_))
    ));
}

#[tokio::test]
async fn init_removes_interrupted_writes() {
    let (dir, store) = store().await;
    let envelope = envelope(&["a@example.com"]);
    store.write(&envelope).await.unwrap();

    let spool = dir.path().join("spool");
    let orphan = spool.join(format!(".tmp_{}", envelope.id().filename()));
    let deleted = spool.join(format!("{}.deleted", envelope.id().filename()));
    tokio::fs::write(&orphan, b"partial").await.unwrap();
    tokio::fs::write(&deleted, b"stale").await.unwrap();

    store.init().await.unwrap();

    assert!(!orphan.exists());
    assert!(!deleted.exists());
    assert_eq!(store.list().await.unwrap(), [envelope.id()]);
}
