//! Per-document sync session.
//!
//! A session is the single writer for one open document: every edit,
//! relayed change, poll result, and save status passes through its event
//! loop, so local state never needs a lock.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   SessionHandle ──▶│          SyncSession         │──▶ SessionEvent
//!   (commands)       │                              │    (to the UI)
//!                    │  relay ──▶ apply remote edit │
//!                    │  poller ─▶ store-wins merge  │
//!                    │  writer ─▶ save status       │
//!                    │  sweep ──▶ presence changes  │
//!                    └──────────────────────────────┘
//! ```
//!
//! Lifecycle: `Loading` → `Ready` → `Closed`, with `Error` as a terminal
//! state when the initial load fails. A session that fails to load never
//! retries; the caller opens a fresh one.
//!
//! Local edits fan out three ways (schedule a write, publish to the
//! relay, refresh presence) but are not echoed back as events; the
//! editor that produced them already has the text. Remote and reconciled
//! changes are the ones the caller must hear about.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};

use crate::poller::{reconcile, ReconciliationPoller, POLL_INTERVAL_MS};
use crate::presence::{PresenceTracker, SWEEP_INTERVAL_MS};
use crate::protocol::ChangeMessage;
use crate::relay::{ChangeStream, Relay};
use crate::storage::{DocumentStore, StoredDocument};
use crate::writer::{PersistenceWriter, SaveStatus, DEBOUNCE_WINDOW_MS};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub doc_id: String,
    pub user_id: String,
    /// Quiet period between the last edit and its write.
    pub debounce_window: Duration,
    /// How often the store is polled for missed changes.
    pub poll_interval: Duration,
    /// How often stale presence entries are purged.
    pub sweep_interval: Duration,
}

impl SessionConfig {
    /// Production intervals.
    pub fn new(doc_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            user_id: user_id.into(),
            debounce_window: Duration::from_millis(DEBOUNCE_WINDOW_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            sweep_interval: Duration::from_millis(SWEEP_INTERVAL_MS),
        }
    }

    /// Short intervals so tests settle in milliseconds.
    pub fn for_testing(doc_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            user_id: user_id.into(),
            debounce_window: Duration::from_millis(60),
            poll_interval: Duration::from_millis(40),
            sweep_interval: Duration::from_millis(30),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public surface
// ─────────────────────────────────────────────────────────────────────────────

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Fetching the document from the store.
    Loading,
    /// Live: edits flow, timers run.
    Ready,
    /// The initial load failed. Terminal.
    Error,
    /// Shut down cleanly. Terminal.
    Closed,
}

/// Who caused a content change the caller is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Another user's edit arrived over the relay.
    Remote,
    /// The poller found the store ahead of local state.
    Reconciled,
}

/// Everything a session reports outward.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial load finished; these are the authoritative values.
    Loaded { title: String, content: String },
    /// Content was replaced from outside the local editor.
    ContentChanged { content: String, origin: ChangeOrigin },
    /// Title caught up with the store.
    TitleChanged { title: String },
    /// The set of recently-active users changed.
    PresenceChanged { active: Vec<String> },
    /// A debounced write fired; its outcome.
    SaveStatusChanged(SaveStatus),
    /// The initial load failed; the session is dead.
    LoadFailed { error: String },
    /// Clean shutdown finished.
    Closed,
}

enum SessionCommand {
    Edit(String),
    EditTitle(String),
    Close,
}

/// Caller-side handle to a running session.
///
/// Commands sent after the session stopped are dropped silently.
pub struct SessionHandle {
    doc_id: String,
    user_id: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Wait for loading to settle; returns the state reached.
    pub async fn wait_ready(&self) -> SessionState {
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            if state != SessionState::Loading {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return *state_rx.borrow();
            }
        }
    }

    /// Replace the document content with the editor's current text.
    pub async fn edit(&self, content: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::Edit(content.into()))
            .await;
    }

    /// Rename the document.
    pub async fn edit_title(&self, title: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::EditTitle(title.into()))
            .await;
    }

    /// Shut the session down and wait for it to finish.
    ///
    /// An edit still inside its debounce window is dropped, not flushed.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            if matches!(state, SessionState::Closed | SessionState::Error) {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session actor
// ─────────────────────────────────────────────────────────────────────────────

/// The event-loop side of a session. Constructed via [`SyncSession::open`].
pub struct SyncSession {
    config: SessionConfig,
    store: Arc<dyn DocumentStore>,
    relay: Arc<dyn Relay>,
    presence: Arc<PresenceTracker>,
    title: String,
    content: String,
    last_presence: Vec<String>,
    event_tx: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl SyncSession {
    /// Open a document and start its event loop.
    ///
    /// Returns immediately; loading happens on the spawned task. Watch
    /// [`SessionHandle::wait_ready`] or the event stream for the outcome.
    pub fn open(
        config: SessionConfig,
        store: Arc<dyn DocumentStore>,
        relay: Arc<dyn Relay>,
        presence: Arc<PresenceTracker>,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(SessionState::Loading);

        let doc_id = config.doc_id.clone();
        let user_id = config.user_id.clone();

        let session = SyncSession {
            config,
            store,
            relay,
            presence,
            title: String::new(),
            content: String::new(),
            last_presence: Vec::new(),
            event_tx,
            state_tx,
        };
        tokio::spawn(session.run(cmd_rx));

        SessionHandle {
            doc_id,
            user_id,
            cmd_tx,
            event_rx: Some(event_rx),
            state_rx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        let doc = match self.store.get(&self.config.doc_id) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                log::error!("document {} missing from store", self.config.doc_id);
                let msg = format!("document {} not found", self.config.doc_id);
                self.fail(msg, &mut cmd_rx).await;
                return;
            }
            Err(e) => {
                log::error!("load for {} failed: {e}", self.config.doc_id);
                self.fail(e.to_string(), &mut cmd_rx).await;
                return;
            }
        };

        self.title = doc.title;
        self.content = doc.content;
        self.presence
            .mark_active(&self.config.doc_id, &self.config.user_id);

        let (status_tx, status_rx) = mpsc::channel(16);
        let writer = PersistenceWriter::spawn(
            Arc::clone(&self.store),
            self.config.doc_id.clone(),
            self.config.debounce_window,
            status_tx,
        );

        let (poll_tx, poll_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = ReconciliationPoller::spawn(
            Arc::clone(&self.store),
            self.config.doc_id.clone(),
            self.config.poll_interval,
            poll_tx,
            shutdown_rx,
        );

        let mut subscription = Some(
            self.relay
                .subscribe(&self.config.doc_id, &self.config.user_id),
        );
        let mut poll_rx = Some(poll_rx);
        let mut status_rx = Some(status_rx);

        let mut sweep = time::interval_at(
            time::Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let _ = self.state_tx.send(SessionState::Ready);
        let _ = self
            .event_tx
            .send(SessionEvent::Loaded {
                title: self.title.clone(),
                content: self.content.clone(),
            })
            .await;
        self.emit_presence_if_changed().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Edit(content)) => {
                        self.apply_local_edit(content, &writer).await;
                    }
                    Some(SessionCommand::EditTitle(title)) => {
                        self.apply_title_edit(title, &writer).await;
                    }
                    Some(SessionCommand::Close) | None => break,
                },
                msg = next_change(&mut subscription) => match msg {
                    Some(msg) => self.apply_remote_edit(&msg).await,
                    None => {
                        log::warn!("change feed for {} closed", self.config.doc_id);
                        subscription = None;
                    }
                },
                update = next_message(&mut poll_rx) => match update {
                    Some(stored) => self.apply_reconciliation(&stored).await,
                    None => poll_rx = None,
                },
                status = next_message(&mut status_rx) => match status {
                    Some(status) => {
                        let _ = self
                            .event_tx
                            .send(SessionEvent::SaveStatusChanged(status))
                            .await;
                    }
                    None => status_rx = None,
                },
                _ = sweep.tick() => {
                    let purged = self.presence.sweep(&self.config.doc_id);
                    if purged > 0 {
                        log::debug!(
                            "presence sweep purged {purged} stale entries for {}",
                            self.config.doc_id
                        );
                    }
                    self.emit_presence_if_changed().await;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        writer.shutdown().await;
        poller.stopped().await;
        drop(subscription);

        let _ = self.state_tx.send(SessionState::Closed);
        let _ = self.event_tx.send(SessionEvent::Closed).await;
        log::info!(
            "session for {} ({}) closed",
            self.config.doc_id,
            self.config.user_id
        );
    }

    /// Terminal load failure: report it, then swallow commands until close.
    async fn fail(self, error: String, cmd_rx: &mut mpsc::Receiver<SessionCommand>) {
        let _ = self.state_tx.send(SessionState::Error);
        let _ = self.event_tx.send(SessionEvent::LoadFailed { error }).await;

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SessionCommand::Close => break,
                _ => log::debug!(
                    "command against failed session for {} dropped",
                    self.config.doc_id
                ),
            }
        }
    }

    async fn apply_local_edit(&mut self, content: String, writer: &PersistenceWriter) {
        self.content = content;
        writer.schedule(self.title.clone(), self.content.clone());
        self.relay.publish(ChangeMessage::new(
            &self.config.doc_id,
            &self.content,
            &self.config.user_id,
        ));
        self.presence
            .mark_active(&self.config.doc_id, &self.config.user_id);
        self.emit_presence_if_changed().await;
    }

    /// Title changes persist and reconcile; they never ride the relay.
    async fn apply_title_edit(&mut self, title: String, writer: &PersistenceWriter) {
        self.title = title;
        writer.schedule(self.title.clone(), self.content.clone());
        self.presence
            .mark_active(&self.config.doc_id, &self.config.user_id);
        self.emit_presence_if_changed().await;
    }

    /// Whole-body overwrite from another user. No write is scheduled;
    /// the sender's own session persists it.
    async fn apply_remote_edit(&mut self, msg: &ChangeMessage) {
        self.content = msg.content.clone();
        self.presence.mark_active(&self.config.doc_id, &msg.sender);
        let _ = self
            .event_tx
            .send(SessionEvent::ContentChanged {
                content: self.content.clone(),
                origin: ChangeOrigin::Remote,
            })
            .await;
        self.emit_presence_if_changed().await;
    }

    /// Store-wins merge of a polled record into local state.
    async fn apply_reconciliation(&mut self, stored: &StoredDocument) {
        let rec = reconcile(&self.title, &self.content, stored);
        if rec.is_noop() {
            return;
        }
        if let Some(title) = rec.title {
            self.title = title.clone();
            let _ = self.event_tx.send(SessionEvent::TitleChanged { title }).await;
        }
        if let Some(content) = rec.content {
            self.content = content.clone();
            let _ = self
                .event_tx
                .send(SessionEvent::ContentChanged {
                    content,
                    origin: ChangeOrigin::Reconciled,
                })
                .await;
        }
    }

    async fn emit_presence_if_changed(&mut self) {
        let active = self.presence.active_users(&self.config.doc_id);
        if active != self.last_presence {
            self.last_presence = active.clone();
            let _ = self
                .event_tx
                .send(SessionEvent::PresenceChanged { active })
                .await;
        }
    }
}

/// Await the next relayed change, or hang forever once the feed is gone
/// so the select loop stops polling it.
async fn next_change(stream: &mut Option<ChangeStream>) -> Option<Arc<ChangeMessage>> {
    match stream.as_mut() {
        Some(stream) => stream.recv().await,
        None => future::pending().await,
    }
}

/// Same idea for plain channels.
async fn next_message<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
