//! sync-relay: WebSocket transport for synced-map replicas.
//!
//! The relay groups connections by topic and forwards each event frame to
//! the other members of the sender's topic. [`WsChannel`] is the client
//! side and implements `synced_map::Channel`, so replicas in different
//! processes converge through one relay.

pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod server;

pub use client::WsChannel;
pub use connection::{ConnectionEvent, IncomingMessage, PeerConnection};
pub use error::RelayError;
pub use message::{MAX_MESSAGE_SIZE, RelayFrame};
pub use server::{RelayServer, RelayStats, ServerEvent, UPGRADE_TIMEOUT};
