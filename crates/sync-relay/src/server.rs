//! WebSocket relay server.
//!
//! Manages connection lifecycle, topic membership and event routing.
//! The join lifecycle is encapsulated: callers only see `ServerEvent`s
//! for connections that have joined a topic via `poll_event()`.
//!
//! The relay never interprets event payloads. An `event` frame from one
//! member is forwarded byte-for-byte to every other member of its topic,
//! never back to the sender; echo suppression stays with the replicas.

use crate::connection::{ConnectionEvent, IncomingMessage, PeerConnection};
use crate::message::RelayFrame;
use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, trace, warn};

/// How long a new TCP connection may take to complete its WebSocket handshake.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event emitted by the server after the join lifecycle is resolved.
#[derive(Debug)]
pub enum ServerEvent {
    /// A connection joined a topic.
    ClientJoined {
        conn_id: String,
        client_id: String,
        topic: String,
    },
    /// An event frame from a joined connection.
    Message(IncomingMessage),
    /// A joined connection went away.
    ClientLeft { conn_id: String, topic: String },
}

/// Counters reported by [`RelayServer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Connections that have not joined yet
    pub pending: usize,
    /// Connections that joined a topic
    pub members: usize,
    /// Topics with at least one member
    pub topics: usize,
    /// Event frames forwarded since start, counted once per recipient
    pub relayed: u64,
}

/// WebSocket relay grouping connections by topic.
pub struct RelayServer {
    /// Connections that have not sent `join` yet, by conn_id
    pending: HashMap<String, PeerConnection>,
    /// Joined connections, by conn_id
    members: HashMap<String, PeerConnection>,
    /// Topic → conn_ids of its members
    topics: HashMap<String, BTreeSet<String>>,
    next_conn_id: u64,
    relayed: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            pending: HashMap::new(),
            members: HashMap::new(),
            topics: HashMap::new(),
            next_conn_id: 1,
            relayed: 0,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade a new TCP connection to WebSocket and register it.
    ///
    /// The connection stays pending until it sends a `join` frame. Waits at
    /// most [`UPGRADE_TIMEOUT`] for the handshake; `serve` runs upgrades in
    /// their own tasks instead of calling this.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Some(ws_stream) = upgrade(stream, addr).await {
            self.register(ws_stream, addr);
        }
    }

    fn register(&mut self, ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) {
        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;

        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = PeerConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        self.pending.insert(conn_id, conn);
    }

    /// Wait for the next server event.
    ///
    /// Callers only see:
    /// - `ClientJoined` once a connection's join is accepted (its `joined`
    ///   answer is already queued)
    /// - `Message` for event frames of joined connections
    /// - `ClientLeft` when a joined connection closes
    ///
    /// Event frames sent before joining, duplicate joins and connections
    /// closing before they join are dropped here.
    ///
    /// Cancel safe: nothing is awaited once an event has been dequeued, so
    /// using this in `select!` never loses an event or leaves a membership
    /// half-recorded.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            let event = self.event_rx.recv().await?;

            match event {
                ConnectionEvent::Joined {
                    conn_id,
                    topic,
                    client_id,
                } => {
                    let Some(mut conn) = self.pending.remove(&conn_id) else {
                        warn!("Ignoring repeated join from {}", conn_id);
                        continue;
                    };
                    conn.membership = Some((topic.clone(), client_id.clone()));

                    let group = self.topics.entry(topic.clone()).or_default();
                    group.insert(conn_id.clone());
                    let joined = RelayFrame::Joined {
                        topic: topic.clone(),
                        members: group.len(),
                    };
                    // Queued ahead of any frame relayed to this member
                    if let Err(e) = conn.send_frame(&joined) {
                        warn!("Failed to confirm join for {}: {}", conn_id, e);
                    }
                    self.members.insert(conn_id.clone(), conn);

                    info!("{} joined {} as {}", conn_id, topic, client_id);
                    return Some(ServerEvent::ClientJoined {
                        conn_id,
                        client_id,
                        topic,
                    });
                }
                ConnectionEvent::Message(msg) => {
                    if self.members.contains_key(&msg.conn_id) {
                        return Some(ServerEvent::Message(msg));
                    }
                    warn!("Dropping {} from {} before join", msg.event, msg.conn_id);
                }
                ConnectionEvent::Closed { conn_id } => {
                    if let Some(conn) = self.members.remove(&conn_id) {
                        let topic = conn.topic().unwrap_or_default().to_string();
                        self.leave_topic(&topic, &conn_id);
                        info!("{} left {}", conn_id, topic);
                        return Some(ServerEvent::ClientLeft { conn_id, topic });
                    }
                    self.pending.remove(&conn_id);
                    debug!("Connection closed before join: {}, not emitting event", conn_id);
                }
            }
        }
    }

    fn leave_topic(&mut self, topic: &str, conn_id: &str) {
        if let Some(group) = self.topics.get_mut(topic) {
            group.remove(conn_id);
            if group.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Forward `data` to every member of the sender's topic except the sender.
    ///
    /// Returns the number of members it was queued for.
    pub fn relay(&mut self, conn_id: &str, data: &[u8]) -> usize {
        let Some(topic) = self.members.get(conn_id).and_then(|c| c.topic()) else {
            warn!("Cannot relay for unknown connection {}", conn_id);
            return 0;
        };
        let Some(group) = self.topics.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for member_id in group.iter().filter(|id| id.as_str() != conn_id) {
            let Some(conn) = self.members.get(member_id) else {
                continue;
            };
            match conn.send(data) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to relay to {}: {}", member_id, e),
            }
        }

        self.relayed += delivered as u64;
        delivered
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            pending: self.pending.len(),
            members: self.members.len(),
            topics: self.topics.len(),
            relayed: self.relayed,
        }
    }

    /// Conn_ids of the members of `topic`.
    pub fn topic_members(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|group| group.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run the relay loop: accept connections and forward event frames.
    ///
    /// Each WebSocket upgrade runs in its own task, so a client that never
    /// finishes its handshake cannot stall the loop. Runs until the listener
    /// fails; cancel the future to stop.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<()> {
        let (upgraded_tx, mut upgraded_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result?;
                    let upgraded_tx = upgraded_tx.clone();
                    tokio::spawn(async move {
                        if let Some(ws_stream) = upgrade(stream, addr).await {
                            let _ = upgraded_tx.send((ws_stream, addr));
                        }
                    });
                }

                Some((ws_stream, addr)) = upgraded_rx.recv() => {
                    self.register(ws_stream, addr);
                }

                Some(event) = self.poll_event() => {
                    match event {
                        ServerEvent::Message(msg) => {
                            let delivered = self.relay(&msg.conn_id, &msg.data);
                            trace!("Relayed {} from {} to {} member(s)", msg.event, msg.conn_id, delivered);
                        }
                        ServerEvent::ClientJoined { .. } | ServerEvent::ClientLeft { .. } => {
                            debug!("{:?}", self.stats());
                        }
                    }
                }
            }
        }
    }

    /// Close every connection, flushing frames already queued for them.
    pub async fn shutdown(&mut self) {
        let count = self.pending.len() + self.members.len();
        let conns: Vec<PeerConnection> = self
            .pending
            .drain()
            .chain(self.members.drain())
            .map(|(_, conn)| conn)
            .collect();
        self.topics.clear();
        futures::future::join_all(conns.into_iter().map(PeerConnection::close)).await;
        info!("Closed {} connection(s)", count);
    }
}

/// Complete the WebSocket handshake within [`UPGRADE_TIMEOUT`].
async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Option<WebSocketStream<TcpStream>> {
    match timeout(UPGRADE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws_stream)) => Some(ws_stream),
        Ok(Err(e)) => {
            // Health checks connect and close without finishing the upgrade
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before upgrade from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            None
        }
        Err(_) => {
            warn!("WebSocket upgrade from {} timed out, dropping", addr);
            None
        }
    }
}
