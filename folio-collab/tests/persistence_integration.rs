//! Persistence integration tests.
//!
//! Verifies:
//! - Debounced session writes land in RocksDB
//! - Data survives closing and reopening the store
//! - Rapid edits coalesce to the last value on disk
//! - Title and content persist together
//! - Multi-document isolation within one store
//! - Last write wins between two live sessions
//! - External store writes reconcile back into a session

use folio_collab::presence::PresenceTracker;
use folio_collab::relay::ChangeRelay;
use folio_collab::session::{
    ChangeOrigin, SessionConfig, SessionEvent, SessionHandle, SessionState, SyncSession,
};
use folio_collab::storage::{DocumentStore, RocksStore, StoreConfig};
use folio_collab::writer::SaveStatus;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_millis(2_000);

// ─── Helpers ─────────────────────────────────────────────────────

fn open_store(path: &Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

/// Session wired to an in-process relay, for store-focused tests.
fn open_session(
    doc_id: &str,
    user_id: &str,
    store: Arc<RocksStore>,
    relay: Arc<ChangeRelay>,
) -> SessionHandle {
    SyncSession::open(
        SessionConfig::for_testing(doc_id, user_id),
        store,
        relay,
        Arc::new(PresenceTracker::new()),
    )
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

/// Read events until one matches, panicking on timeout.
async fn event_matching(
    rx: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_saved(rx: &mut mpsc::Receiver<SessionEvent>) {
    event_matching(rx, |e| {
        matches!(e, SessionEvent::SaveStatusChanged(SaveStatus::Saved { .. }))
    })
    .await;
}

/// Generate markdown of the given approximate byte count.
fn markdown_body(approx_bytes: usize) -> String {
    let pattern = "## Section\n\nThe quick brown fox jumps over the lazy dog.\n\n";
    pattern.repeat(approx_bytes / pattern.len() + 1)
}

// ─── Session → RocksDB ───────────────────────────────────────────

#[tokio::test]
async fn test_session_write_lands_in_rocks() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put("AB12CD", "Untitled", "").unwrap();

    let mut session = open_session("AB12CD", "A", store.clone(), Arc::new(ChangeRelay::with_defaults()));
    let mut events = session.take_event_rx().unwrap();
    assert_eq!(session.wait_ready().await, SessionState::Ready);

    session.edit("# Meeting notes\n\n- item one\n").await;
    wait_saved(&mut events).await;

    let doc = store.get("AB12CD").unwrap().unwrap();
    assert_eq!(doc.title, "Untitled");
    assert_eq!(doc.content, "# Meeting notes\n\n- item one\n");
    assert!(doc.updated_at > 0);

    session.close().await;
}

#[tokio::test]
async fn test_data_survives_store_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path());
        store.put("AB12CD", "Roadmap", "").unwrap();

        let mut session =
            open_session("AB12CD", "A", store.clone(), Arc::new(ChangeRelay::with_defaults()));
        let mut events = session.take_event_rx().unwrap();
        assert_eq!(session.wait_ready().await, SessionState::Ready);

        session.edit("Q3: ship the editor").await;
        wait_saved(&mut events).await;
        session.close().await;
    }

    // Fresh store handle over the same directory, fresh session
    let store = open_store(dir.path());
    let mut session = open_session("AB12CD", "B", store, Arc::new(ChangeRelay::with_defaults()));
    let mut events = session.take_event_rx().unwrap();
    assert_eq!(session.wait_ready().await, SessionState::Ready);

    let loaded = event_matching(&mut events, |e| matches!(e, SessionEvent::Loaded { .. })).await;
    assert_eq!(
        loaded,
        SessionEvent::Loaded {
            title: "Roadmap".to_string(),
            content: "Q3: ship the editor".to_string(),
        }
    );

    session.close().await;
}

#[tokio::test]
async fn test_rapid_edits_persist_last_value() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put("AB12CD", "Untitled", "").unwrap();

    let mut session = open_session("AB12CD", "A", store.clone(), Arc::new(ChangeRelay::with_defaults()));
    let mut events = session.take_event_rx().unwrap();
    assert_eq!(session.wait_ready().await, SessionState::Ready);

    for i in 0..20 {
        session.edit(format!("draft {i}")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    wait_saved(&mut events).await;
    // Let any trailing window drain before reading
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.get("AB12CD").unwrap().unwrap().content, "draft 19");

    session.close().await;
}

#[tokio::test]
async fn test_title_and_content_persist_together() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put("AB12CD", "Untitled", "").unwrap();

    let mut session = open_session("AB12CD", "A", store.clone(), Arc::new(ChangeRelay::with_defaults()));
    let mut events = session.take_event_rx().unwrap();
    assert_eq!(session.wait_ready().await, SessionState::Ready);

    session.edit("body text").await;
    session.edit_title("Launch plan").await;
    wait_saved(&mut events).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let doc = store.get("AB12CD").unwrap().unwrap();
    assert_eq!(doc.title, "Launch plan");
    assert_eq!(doc.content, "body text");

    session.close().await;
}

#[tokio::test]
async fn test_documents_isolated_within_one_store() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put("DOC1AA", "One", "").unwrap();
    store.put("DOC2BB", "Two", "").unwrap();

    let relay = Arc::new(ChangeRelay::with_defaults());
    let mut a = open_session("DOC1AA", "A", store.clone(), relay.clone());
    let mut b = open_session("DOC2BB", "B", store.clone(), relay.clone());
    let mut a_events = a.take_event_rx().unwrap();
    let mut b_events = b.take_event_rx().unwrap();
    assert_eq!(a.wait_ready().await, SessionState::Ready);
    assert_eq!(b.wait_ready().await, SessionState::Ready);

    a.edit("first document").await;
    b.edit("second document").await;
    wait_saved(&mut a_events).await;
    wait_saved(&mut b_events).await;

    assert_eq!(store.get("DOC1AA").unwrap().unwrap().content, "first document");
    assert_eq!(store.get("DOC2BB").unwrap().unwrap().content, "second document");

    a.close().await;
    b.close().await;
}

// ─── Concurrent editors ──────────────────────────────────────────

#[tokio::test]
async fn test_last_writer_wins_between_sessions() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put("AB12CD", "Untitled", "").unwrap();

    let relay = Arc::new(ChangeRelay::with_defaults());
    let a = open_session("AB12CD", "A", store.clone(), relay.clone());
    let mut b = open_session("AB12CD", "B", store.clone(), relay.clone());
    let mut b_events = b.take_event_rx().unwrap();
    assert_eq!(a.wait_ready().await, SessionState::Ready);
    assert_eq!(b.wait_ready().await, SessionState::Ready);

    a.edit("A's version").await;
    let received = event_matching(&mut b_events, |e| {
        matches!(e, SessionEvent::ContentChanged { .. })
    })
    .await;
    assert_eq!(
        received,
        SessionEvent::ContentChanged {
            content: "A's version".to_string(),
            origin: ChangeOrigin::Remote,
        }
    );

    // B overwrites after hearing A; B's body is what must survive
    b.edit("B's version").await;
    wait_saved(&mut b_events).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.get("AB12CD").unwrap().unwrap().content, "B's version");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_external_write_reconciles_into_session() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put("AB12CD", "Untitled", "").unwrap();

    let mut session = open_session("AB12CD", "A", store.clone(), Arc::new(ChangeRelay::with_defaults()));
    let mut events = session.take_event_rx().unwrap();
    assert_eq!(session.wait_ready().await, SessionState::Ready);

    // Another server instance writing the same document directly
    store.put("AB12CD", "Renamed elsewhere", "edited elsewhere").unwrap();

    let title = event_matching(&mut events, |e| matches!(e, SessionEvent::TitleChanged { .. })).await;
    assert_eq!(
        title,
        SessionEvent::TitleChanged {
            title: "Renamed elsewhere".to_string(),
        }
    );
    let content = event_matching(&mut events, |e| {
        matches!(e, SessionEvent::ContentChanged { .. })
    })
    .await;
    assert_eq!(
        content,
        SessionEvent::ContentChanged {
            content: "edited elsewhere".to_string(),
            origin: ChangeOrigin::Reconciled,
        }
    );

    session.close().await;
}

// ─── Large documents ─────────────────────────────────────────────

#[tokio::test]
async fn test_large_markdown_roundtrip() {
    let dir = tempdir().unwrap();
    let body = markdown_body(256 * 1024);
    {
        let store = open_store(dir.path());
        store.put("AB12CD", "Untitled", "").unwrap();

        let mut session =
            open_session("AB12CD", "A", store.clone(), Arc::new(ChangeRelay::with_defaults()));
        let mut events = session.take_event_rx().unwrap();
        assert_eq!(session.wait_ready().await, SessionState::Ready);

        session.edit(body.clone()).await;
        wait_saved(&mut events).await;
        session.close().await;
    }

    let store = open_store(dir.path());
    let doc = store.get("AB12CD").unwrap().unwrap();
    assert_eq!(doc.content.len(), body.len());
    assert_eq!(doc.content, body);
}
