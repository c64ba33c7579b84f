//! Wire protocol for replicas of a synced map.
//!
//! Every event is a JSON object internally tagged by `type`, whose value is
//! also the channel event name it is pushed under:
//!
//! ```text
//! {"type":"store:set","key":"x","value":1,"source":"<client id>"}
//! {"type":"store:delete","key":"x","source":"<client id>"}
//! {"type":"store:clear","source":"<client id>"}
//! {"type":"store:invalidate","key":"x","source":"<client id>"}
//! {"type":"store:resync","source":"<client id>"}
//! {"type":"store:snapshot","entries":[["x",1]],"target":"<client id>","source":"<client id>"}
//! ```
//!
//! `source` is only ever used to drop a replica's own echoes; `target`
//! addresses a snapshot to the replica that asked for it.

use crate::client_id::ClientId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SET: &str = "store:set";
pub const DELETE: &str = "store:delete";
pub const CLEAR: &str = "store:clear";
pub const INVALIDATE: &str = "store:invalidate";
pub const RESYNC: &str = "store:resync";
pub const SNAPSHOT: &str = "store:snapshot";

/// Every event name a replica subscribes to when it has no fetcher.
pub const REPLICATION_EVENTS: [&str; 5] = [SET, DELETE, CLEAR, RESYNC, SNAPSHOT];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode {event} payload: {source}")]
    Encode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Expected {expected} event but payload was tagged {found}")]
    UnexpectedEvent { expected: String, found: &'static str },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A replication event exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreEvent<K, V> {
    /// Upsert `key`; version-gated on the receiving side.
    #[serde(rename = "store:set")]
    Set { key: K, value: V, source: ClientId },

    /// Remove `key`.
    #[serde(rename = "store:delete")]
    Delete { key: K, source: ClientId },

    /// Remove every key.
    #[serde(rename = "store:clear")]
    Clear { source: ClientId },

    /// Ask replicas with a fetcher to refresh `key` from the authoritative source.
    #[serde(rename = "store:invalidate")]
    Invalidate { key: K, source: ClientId },

    /// Ask every peer for its full state.
    #[serde(rename = "store:resync")]
    Resync { source: ClientId },

    /// Full state of `source`, addressed to the replica that asked for it.
    #[serde(rename = "store:snapshot")]
    Snapshot {
        entries: Vec<(K, V)>,
        target: ClientId,
        source: ClientId,
    },
}

impl<K, V> StoreEvent<K, V> {
    /// Channel event name this event is pushed under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => SET,
            Self::Delete { .. } => DELETE,
            Self::Clear { .. } => CLEAR,
            Self::Invalidate { .. } => INVALIDATE,
            Self::Resync { .. } => RESYNC,
            Self::Snapshot { .. } => SNAPSHOT,
        }
    }

    /// The replica that emitted this event.
    pub fn source(&self) -> &ClientId {
        match self {
            Self::Set { source, .. }
            | Self::Delete { source, .. }
            | Self::Clear { source }
            | Self::Invalidate { source, .. }
            | Self::Resync { source }
            | Self::Snapshot { source, .. } => source,
        }
    }
}

impl<K: Serialize, V: Serialize> StoreEvent<K, V> {
    /// Encode as a JSON payload for [`Channel::push`](crate::Channel::push).
    pub fn to_payload(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|source| ProtocolError::Encode {
            event: self.name(),
            source,
        })
    }
}

impl<K: DeserializeOwned, V: DeserializeOwned> StoreEvent<K, V> {
    /// Decode a payload received from the channel.
    pub fn from_payload(payload: Value) -> Result<Self> {
        Ok(serde_json::from_value(payload)?)
    }

    /// Decode a payload delivered under `event`, rejecting mismatched tags.
    pub fn decode(event: &str, payload: Value) -> Result<Self> {
        let decoded = Self::from_payload(payload)?;
        if decoded.name() != event {
            return Err(ProtocolError::UnexpectedEvent {
                expected: event.to_string(),
                found: decoded.name(),
            });
        }
        Ok(decoded)
    }
}
