//! Individual client connection management.
//!
//! Each connection wraps an accepted WebSocket stream split into two tasks:
//! a read task forwarding frames to the server, and a write task draining
//! the connection's outgoing queue. Sending only enqueues, so the server
//! never awaits a slow client.

use crate::message::{MAX_MESSAGE_SIZE, RelayFrame};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, trace, warn};

/// How long `close` waits for queued frames and the close frame to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An `event` frame received from a client, kept as raw bytes for relaying.
#[derive(Debug)]
pub struct IncomingMessage {
    /// Connection ID assigned by the server (e.g., "conn-1")
    pub conn_id: String,
    /// Channel event name, for logging
    pub event: String,
    /// The frame exactly as received
    pub data: Vec<u8>,
}

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Client asked to join a topic
    Joined {
        conn_id: String,
        topic: String,
        client_id: String,
    },
    /// Client sent an event frame
    Message(IncomingMessage),
    /// Connection was closed
    Closed { conn_id: String },
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A single accepted WebSocket connection.
pub struct PeerConnection {
    pub conn_id: String,
    /// Topic and client label, known after the join frame
    pub membership: Option<(String, String)>,
    outgoing: mpsc::UnboundedSender<Message>,
    read_task: JoinHandle<()>,
    write_task: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Wrap an accepted stream and spawn its read and write tasks.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(Self::read_loop(conn_id.clone(), read, event_tx));
        let write_task = tokio::spawn(Self::write_loop(conn_id.clone(), write, outgoing_rx));

        Self {
            conn_id,
            membership: None,
            outgoing,
            read_task,
            write_task: Some(write_task),
        }
    }

    async fn read_loop(
        conn_id: String,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", conn_id);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Connection {} closed", conn_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", conn_id, e);
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    conn_id,
                    data.len(),
                    MAX_MESSAGE_SIZE
                );
                continue;
            }

            let event = match RelayFrame::from_binary(&data) {
                Some(RelayFrame::Join { topic, client_id }) => {
                    debug!("{} joining {} as {}", conn_id, topic, client_id);
                    ConnectionEvent::Joined {
                        conn_id: conn_id.clone(),
                        topic,
                        client_id,
                    }
                }
                Some(RelayFrame::Event { event, .. }) => {
                    trace!("{} sent {} ({} bytes)", conn_id, event, data.len());
                    ConnectionEvent::Message(IncomingMessage {
                        conn_id: conn_id.clone(),
                        event,
                        data,
                    })
                }
                Some(RelayFrame::Joined { .. }) | None => {
                    warn!("Unexpected frame from {}, dropping", conn_id);
                    continue;
                }
            };

            if event_tx.send(event).is_err() {
                // Server is gone
                return;
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Drain the outgoing queue in order. Ends after a close frame, or with
    /// one once every sender is gone.
    async fn write_loop(
        conn_id: String,
        mut write: WsSink,
        mut outgoing: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = outgoing.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("Stopped writing to {}: {}", conn_id, e);
                return;
            }
            if closing {
                return;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    }

    /// Queue binary data for the client.
    ///
    /// Frames are written in the order they were queued. Fails only once
    /// the write task has stopped.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.outgoing
            .send(Message::Binary(data.to_vec()))
            .map_err(|_| anyhow!("Connection {} is closed", self.conn_id))
    }

    /// Queue a frame for the client.
    pub fn send_frame(&self, frame: &RelayFrame) -> Result<()> {
        self.send(&frame.to_binary()?)
    }

    pub fn topic(&self) -> Option<&str> {
        self.membership.as_ref().map(|(topic, _)| topic.as_str())
    }

    /// Flush queued frames, send a close frame and stop both tasks.
    pub async fn close(mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(task) = self.write_task.take() {
            if timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!("Timed out closing {}", self.conn_id);
            }
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        // The write task ends on its own once `outgoing` is dropped
        self.read_task.abort();
    }
}
