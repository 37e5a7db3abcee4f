//! WebSocket relay client.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect on a fixed delay, close)
//! - Frame send/receive with a local [`ChangeRelay`] as the fan-in hub
//! - Automatic re-join of subscribed documents after a reconnect
//!
//! The client enforces at-most-once delivery from its side too: edits
//! published while the connection is down are dropped, not queued. The
//! store is the durable path; the relay only ever carries live edits.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ChangeMessage, Frame};
use crate::relay::{ChangeRelay, ChangeStream, Relay};

/// Fixed delay between reconnection attempts.
pub const RECONNECT_DELAY_MS: u64 = 5_000;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// The relay client: one WebSocket connection per user.
///
/// Sessions talk to it through the [`Relay`] trait, exactly as they
/// would to an in-process [`ChangeRelay`]; swapping one for the other
/// changes nothing above this layer.
pub struct RelayClient {
    server_url: String,
    user_id: String,
    reconnect_delay: Duration,
    /// Shared with the io task; std lock so the sync `Relay` surface can read it
    state: Arc<RwLock<ConnectionState>>,
    /// Local fan-out of frames arriving from the server
    hub: Arc<ChangeRelay>,
    /// Documents to re-join after every (re)connect
    joined: Arc<Mutex<HashSet<String>>>,
    out_tx: mpsc::Sender<Frame>,
    out_rx: Option<mpsc::Receiver<Frame>>,
    shutdown_tx: watch::Sender<bool>,
    io_task: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Create a client for `user_id` against `server_url`.
    ///
    /// No connection is made until [`connect`](Self::connect).
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::with_backoff(
            server_url,
            user_id,
            Duration::from_millis(RECONNECT_DELAY_MS),
        )
    }

    /// Create with a custom reconnect delay (for testing).
    pub fn with_backoff(
        server_url: impl Into<String>,
        user_id: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            server_url: server_url.into(),
            user_id: user_id.into(),
            reconnect_delay,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            hub: Arc::new(ChangeRelay::with_defaults()),
            joined: Arc::new(Mutex::new(HashSet::new())),
            out_tx,
            out_rx: Some(out_rx),
            shutdown_tx,
            io_task: None,
        }
    }

    /// Start the connection task.
    ///
    /// The task keeps retrying on the configured delay until
    /// [`close`](Self::close); a second call is a no-op.
    pub fn connect(&mut self) {
        let Some(out_rx) = self.out_rx.take() else {
            log::debug!("connect called twice for {}", self.user_id);
            return;
        };

        self.io_task = Some(tokio::spawn(run_io(
            self.server_url.clone(),
            self.user_id.clone(),
            self.reconnect_delay,
            self.state.clone(),
            self.hub.clone(),
            self.joined.clone(),
            out_rx,
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Stop the connection task and wait for it to exit.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.io_task.take() {
            let _ = handle.await;
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the client reports `Connected`; false on timeout.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.connection_state() == ConnectionState::Connected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn joined_docs(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Relay for RelayClient {
    fn subscribe(&self, doc_id: &str, subscriber_id: &str) -> ChangeStream {
        let newly_joined = self.joined_docs().insert(doc_id.to_string());
        if newly_joined {
            // Best effort; the io task re-joins from the set on every connect
            let frame = Frame::Join {
                doc_id: doc_id.to_string(),
                user_id: self.user_id.clone(),
            };
            let _ = self.out_tx.try_send(frame);
        }
        self.hub.subscribe(doc_id, subscriber_id)
    }

    fn publish(&self, msg: ChangeMessage) {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            log::debug!("dropping edit for {} while {state:?}", msg.doc_id);
            return;
        }
        if self.out_tx.try_send(Frame::Edit(msg)).is_err() {
            log::warn!("outgoing channel full; edit dropped");
        }
    }
}

fn set_state(state: &Arc<RwLock<ConnectionState>>, next: ConnectionState) {
    *state.write().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Connection supervisor: connect, pump frames, retry on a fixed delay.
async fn run_io(
    server_url: String,
    user_id: String,
    reconnect_delay: Duration,
    state: Arc<RwLock<ConnectionState>>,
    hub: Arc<ChangeRelay>,
    joined: Arc<Mutex<HashSet<String>>>,
    mut out_rx: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut first_attempt = true;

    'supervisor: loop {
        set_state(
            &state,
            if first_attempt {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            },
        );
        first_attempt = false;

        let ws = tokio::select! {
            result = tokio_tungstenite::connect_async(&server_url) => match result {
                Ok((ws, _)) => ws,
                Err(e) => {
                    log::warn!("connect to {server_url} failed: {e}");
                    if wait_or_shutdown(reconnect_delay, &mut shutdown).await {
                        break 'supervisor;
                    }
                    continue 'supervisor;
                }
            },
            _ = shutdown.changed() => break 'supervisor,
        };

        set_state(&state, ConnectionState::Connected);
        log::info!("{user_id} connected to {server_url}");
        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Frames staged while offline are stale; drop them rather than replay
        while out_rx.try_recv().is_ok() {}

        // Re-join every subscribed document on this fresh connection
        let docs: Vec<String> = joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let mut link_ok = true;
        for doc_id in docs {
            let frame = Frame::Join {
                doc_id,
                user_id: user_id.clone(),
            };
            match frame.encode() {
                Ok(encoded) => {
                    if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                        link_ok = false;
                        break;
                    }
                }
                Err(e) => log::error!("join frame encode failed: {e}"),
            }
        }

        while link_ok {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => match frame.encode() {
                        Ok(encoded) => {
                            if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::error!("frame encode failed: {e}"),
                    },
                    // Client dropped without close()
                    None => break 'supervisor,
                },

                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                        Ok(Frame::Edit(msg)) => hub.publish(msg),
                        Ok(Frame::Ping) => {
                            let Ok(encoded) = Frame::Pong.encode() else { continue };
                            if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("malformed frame from server: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error for {user_id}: {e}");
                        break;
                    }
                    _ => {}
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'supervisor;
                    }
                }
            }
        }

        set_state(&state, ConnectionState::Reconnecting);
        log::info!(
            "{user_id} lost connection to {server_url}; retrying in {}ms",
            reconnect_delay.as_millis()
        );
        if wait_or_shutdown(reconnect_delay, &mut shutdown).await {
            break 'supervisor;
        }
    }

    set_state(&state, ConnectionState::Disconnected);
}

/// Sleep out the reconnect delay; true means shutdown was requested.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::now_ms;
    use crate::server::RelayServer;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(2_000);
    const BACKOFF: Duration = Duration::from_millis(40);

    async fn start_server() -> (Arc<RelayServer>, String) {
        let server = Arc::new(RelayServer::with_defaults());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });
        (server, format!("ws://{addr}"))
    }

    /// Poll the server-side relay until the topic has `n` subscribers.
    async fn wait_subscribers(server: &RelayServer, doc_id: &str, n: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if server.relay().subscriber_count(doc_id) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "topic {doc_id} never reached {n} subscribers (have {})",
            server.relay().subscriber_count(doc_id)
        );
    }

    // ── Construction ─────────────────────────────────────────────

    #[test]
    fn test_client_creation() {
        let client = RelayClient::new("ws://localhost:9090", "A");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.user_id(), "A");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }

    // ── Offline behavior ─────────────────────────────────────────

    #[tokio::test]
    async fn test_publish_while_disconnected_drops() {
        let client = RelayClient::with_backoff("ws://localhost:9090", "A", BACKOFF);
        let mut stream = client.subscribe("ABC123", "watcher");

        client.publish(ChangeMessage::new("ABC123", "lost", "A"));

        // Nothing reaches the local hub: the edit was dropped, not queued
        let got = timeout(Duration::from_millis(100), stream.recv()).await;
        assert!(got.is_err(), "offline edit was delivered");
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_retrying() {
        let mut client = RelayClient::with_backoff("ws://127.0.0.1:1", "A", BACKOFF);
        client.connect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = client.connection_state();
        assert!(
            matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            ),
            "unexpected state {state:?}"
        );

        client.close().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let mut client = RelayClient::with_backoff("ws://127.0.0.1:1", "A", BACKOFF);
        client.connect();
        client.connect();
        client.close().await;
    }

    // ── Live server ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_publish_reaches_other_client() {
        let (server, url) = start_server().await;

        let mut b = RelayClient::with_backoff(&url, "B", BACKOFF);
        b.connect();
        assert!(b.wait_connected(WAIT).await);
        let mut b_stream = b.subscribe("ABC123", "B");
        wait_subscribers(&server, "ABC123", 1).await;

        let mut a = RelayClient::with_backoff(&url, "A", BACKOFF);
        a.connect();
        assert!(a.wait_connected(WAIT).await);

        let before = now_ms();
        a.publish(ChangeMessage::new("ABC123", "Hello, world", "A"));

        let msg = timeout(WAIT, b_stream.recv()).await.unwrap().unwrap();
        assert_eq!(msg.doc_id, "ABC123");
        assert_eq!(msg.content, "Hello, world");
        assert_eq!(msg.sender, "A");
        assert!(msg.timestamp >= before, "server restamp missing");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_own_edits_not_delivered_back() {
        let (server, url) = start_server().await;

        let mut a = RelayClient::with_backoff(&url, "A", BACKOFF);
        a.connect();
        assert!(a.wait_connected(WAIT).await);
        let mut a_stream = a.subscribe("ABC123", "A");
        wait_subscribers(&server, "ABC123", 1).await;

        a.publish(ChangeMessage::new("ABC123", "just mine", "A"));

        let echo = timeout(Duration::from_millis(150), a_stream.recv()).await;
        assert!(echo.is_err(), "publisher heard its own edit");

        a.close().await;
    }

    #[tokio::test]
    async fn test_rejoins_after_server_comes_up() {
        // Reserve a port, then free it so the client's first attempts fail
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = RelayClient::with_backoff(format!("ws://{addr}"), "A", BACKOFF);
        client.connect();
        let mut stream = client.subscribe("ABC123", "A");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_ne!(client.connection_state(), ConnectionState::Connected);

        // Server appears on the same address; the client finds it and re-joins
        let server = Arc::new(RelayServer::with_defaults());
        let listener = TcpListener::bind(addr).await.unwrap();
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });

        assert!(client.wait_connected(WAIT).await);
        wait_subscribers(&server, "ABC123", 1).await;

        // The re-joined subscription is live
        server
            .relay()
            .publish(ChangeMessage::new("ABC123", "fresh start", "B"));
        let msg = timeout(WAIT, stream.recv()).await.unwrap().unwrap();
        assert_eq!(msg.content, "fresh start");

        client.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_retry_loop() {
        let mut client = RelayClient::with_backoff("ws://127.0.0.1:1", "A", BACKOFF);
        client.connect();
        timeout(WAIT, client.close()).await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
