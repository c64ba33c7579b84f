//! Relay wire frames.
//!
//! Frames are JSON sent as binary WebSocket frames (UTF-8 bytes). A client
//! joins one topic, then exchanges `event` frames that the relay forwards
//! verbatim to every other member of that topic.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum frame size (1 MiB). Larger frames are dropped without closing
/// the connection.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A frame exchanged between the relay and its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayFrame {
    /// Client → relay: subscribe this connection to `topic`.
    Join {
        topic: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// Relay → client: the join was accepted. `members` counts the joiner.
    Joined { topic: String, members: usize },
    /// Either direction: a channel event and its payload.
    Event { event: String, payload: Value },
}

impl RelayFrame {
    /// Serialize to UTF-8 JSON bytes for sending as a binary WebSocket frame.
    pub fn to_binary(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Try to parse a frame from binary data.
    ///
    /// Returns None if the data is not UTF-8 JSON or not a known frame.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
