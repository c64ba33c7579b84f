//! WebSocket client for the relay, usable as a map channel.
//!
//! ```text
//!   SyncedMap ──push──► WsChannel ──dispatch──► local handlers (same process)
//!                           │
//!                           └── event frame ──► relay ──► other members
//!   relay ──event frame──► read task ──dispatch──► local handlers
//! ```

use crate::error::RelayError;
use crate::message::{MAX_MESSAGE_SIZE, RelayFrame};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use synced_map::{Channel, Handler, LocalChannel, SubscriptionId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A [`Channel`] whose events travel through a relay topic.
///
/// Handlers registered on it receive events from other relay members and
/// from other pushers on this same channel, including the pusher itself.
pub struct WsChannel {
    local: LocalChannel,
    outgoing: mpsc::UnboundedSender<Message>,
    client_id: String,
    topic: String,
    members: usize,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WsChannel {
    /// Connect to the relay at `url` and join `topic`.
    ///
    /// Resolves once the relay has confirmed the join. Must be called inside
    /// a tokio runtime; the channel's tasks are spawned on it.
    pub async fn connect(url: &str, topic: &str) -> Result<Self, RelayError> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let client_id = Uuid::new_v4().to_string();
        let join = RelayFrame::Join {
            topic: topic.to_string(),
            client_id: client_id.clone(),
        };
        write.send(Message::Binary(join.to_binary()?)).await?;

        let members = timeout(JOIN_TIMEOUT, wait_for_joined(&mut read, topic))
            .await
            .map_err(|_| RelayError::JoinTimeout {
                topic: topic.to_string(),
            })??;
        info!("Joined {} on {} ({} member(s))", topic, url, members);

        let local = LocalChannel::new();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, outgoing_rx));
        let reader = tokio::spawn(read_loop(read, local.clone()));

        Ok(Self {
            local,
            outgoing,
            client_id,
            topic: topic.to_string(),
            members,
            writer,
            reader,
        })
    }

    /// Label this connection joined with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic size reported by the relay when this channel joined.
    pub fn members_at_join(&self) -> usize {
        self.members
    }

    /// Whether the connection to the relay is still up.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.outgoing.is_closed()
    }
}

impl Channel for WsChannel {
    fn push(&self, event: &str, payload: Value) {
        let frame = RelayFrame::Event {
            event: event.to_string(),
            payload: payload.clone(),
        };
        match frame.to_binary() {
            Ok(data) => {
                if self.outgoing.send(Message::Binary(data)).is_err() {
                    warn!("Relay connection closed, {} not sent upstream", event);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", event, e),
        }

        self.local.push(event, payload);
    }

    fn on(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.local.on(event, handler)
    }

    fn off(&self, event: &str, id: SubscriptionId) {
        self.local.off(event, id);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("client_id", &self.client_id)
            .field("topic", &self.topic)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Read frames until the relay confirms the join, returning the member count.
async fn wait_for_joined(
    read: &mut SplitStream<ClientStream>,
    topic: &str,
) -> Result<usize, RelayError> {
    while let Some(msg) = read.next().await {
        let data = match msg? {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => break,
            _ => continue,
        };
        match RelayFrame::from_binary(&data) {
            Some(RelayFrame::Joined { members, .. }) => return Ok(members),
            _ => debug!("Ignoring frame received before join confirmation"),
        }
    }

    Err(RelayError::ClosedBeforeJoin {
        topic: topic.to_string(),
    })
}

async fn write_loop(
    mut write: SplitSink<ClientStream, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = write.send(msg).await {
            warn!("Failed to send to relay: {}", e);
            break;
        }
    }
    let _ = write.send(Message::Close(None)).await;
}

async fn read_loop(mut read: SplitStream<ClientStream>, local: LocalChannel) {
    while let Some(msg) = read.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Relay connection error: {}", e);
                break;
            }
        };

        if data.len() > MAX_MESSAGE_SIZE {
            warn!("Dropping oversize frame ({} bytes)", data.len());
            continue;
        }

        match RelayFrame::from_binary(&data) {
            Some(RelayFrame::Event { event, payload }) => {
                trace!("Relay delivered {}", event);
                local.push(&event, payload);
            }
            _ => warn!("Unexpected frame from relay, dropping"),
        }
    }
    debug!("Relay connection closed");
}
