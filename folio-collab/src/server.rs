//! WebSocket relay server with per-document topic routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── ChangeRelay topic (doc_id)
//! Client B ──┘         │
//!                      ├──▶ Client B   (A's edits)
//!                      └──▶ Client A   (B's edits)
//! ```
//!
//! The server is deliberately thin: it decodes frames, restamps edit
//! timestamps with its own clock, and hands fan-out to [`ChangeRelay`].
//! A connection holds one change feed per joined document, so a client
//! can multiplex every open document over a single socket. The server
//! keeps no document state and replays nothing; a client that joins
//! late starts from whatever the store gave it and hears only edits
//! published after its `Join`.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 11

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::select_all;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{now_ms, ChangeMessage, Frame};
use crate::relay::{ChangeRelay, ChangeStream, Relay, DEFAULT_RELAY_CAPACITY};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document topic
    pub relay_capacity: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            relay_capacity: DEFAULT_RELAY_CAPACITY,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub edits_relayed: u64,
    pub frames_dropped: u64,
    pub active_topics: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayServerConfig,
    /// Fan-out hub shared by every connection
    relay: Arc<ChangeRelay>,
    stats: Arc<RwLock<RelayServerStats>>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: RelayServerConfig) -> Self {
        let relay = Arc::new(ChangeRelay::new(config.relay_capacity));
        Self {
            config,
            relay,
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<ChangeRelay>,
        stats: Arc<RwLock<RelayServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection: one change feed per joined document
        let mut user_id: Option<String> = None;
        let mut subscriptions: HashMap<String, ChangeStream> = HashMap::new();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match Frame::decode(&data) {
                                Ok(Frame::Join { doc_id: doc, user_id: user }) => {
                                    // Subscribe before acking anything so no
                                    // published edit can slip past the join.
                                    // A repeat join replaces that document's
                                    // feed; the others keep theirs.
                                    subscriptions.insert(doc.clone(), relay.subscribe(&doc, &user));
                                    log::info!("{user} joined document {doc} from {addr}");
                                    user_id = Some(user);

                                    let mut s = stats.write().await;
                                    s.active_topics = relay.topic_count();
                                }

                                Ok(Frame::Edit(mut msg)) => {
                                    if subscriptions.is_empty() {
                                        // A connection must join before it may publish
                                        log::warn!("edit from {addr} before any join; dropped");
                                        let mut s = stats.write().await;
                                        s.frames_dropped += 1;
                                    } else {
                                        // The server clock is authoritative
                                        msg.timestamp = now_ms();
                                        relay.publish(msg);

                                        let mut s = stats.write().await;
                                        s.edits_relayed += 1;
                                    }
                                }

                                Ok(Frame::Ping) => {
                                    let encoded = Frame::Pong.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                Ok(Frame::Pong) => {}

                                Err(e) => {
                                    log::warn!("malformed frame from {addr}: {e}");
                                    let mut s = stats.write().await;
                                    s.frames_dropped += 1;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing relayed change, merged across joined documents
                (doc, msg) = next_change(&mut subscriptions) => {
                    match msg {
                        Some(msg) => {
                            let encoded = Frame::Edit((*msg).clone()).encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }
                        None => {
                            log::warn!("change feed for {doc} closed");
                            subscriptions.remove(&doc);
                        }
                    }
                }
            }
        }

        // Cleanup: drop every subscription, then collect empty topics
        if let Some(user) = &user_id {
            for doc in subscriptions.keys() {
                log::info!("{user} left document {doc}");
            }
        }
        drop(subscriptions);
        let removed = relay.remove_idle_topics();
        if removed > 0 {
            log::debug!("removed {removed} idle topics");
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_topics = relay.topic_count();
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> RelayServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the shared fan-out hub.
    pub fn relay(&self) -> &Arc<ChangeRelay> {
        &self.relay
    }
}

/// Wait for the next relayed change on any of a connection's feeds.
///
/// Pends forever while nothing is joined. The feed's document id rides
/// along with the message so a closed feed can be dropped from the set.
async fn next_change(
    subscriptions: &mut HashMap<String, ChangeStream>,
) -> (String, Option<Arc<ChangeMessage>>) {
    if subscriptions.is_empty() {
        return std::future::pending().await;
    }
    let recvs = subscriptions
        .iter_mut()
        .map(|(doc, stream)| Box::pin(async move { (doc.clone(), stream.recv().await) }))
        .collect::<Vec<_>>();
    let (result, _, _) = select_all(recvs).await;
    result
}
