//! ClientId: identifies one replica of a synced map.
//!
//! Every outgoing event carries the sender's id so that a replica can
//! recognise (and drop) its own events when the channel hands them back.
//! Ids are opaque: this crate generates UUIDs, but any non-empty string a
//! peer sends is accepted and only ever compared for equality.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientIdError {
    #[error("Invalid client ID: must not be empty")]
    Empty,
}

/// A unique identifier for a single map replica.
///
/// Generated once per map instance as a hyphenated lowercase UUID v4.
/// Serializes as a plain string.
///
/// # Examples
/// ```
/// use synced_map::ClientId;
///
/// let id = ClientId::generate();
/// let parsed: ClientId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
///
/// let foreign: ClientId = "tab-1".parse().unwrap();
/// assert_eq!(foreign.as_str(), "tab-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Generate a new random client ID (UUID v4).
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ClientIdError::Empty);
        }
        Ok(Self(Arc::from(s)))
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(Arc::from(id.hyphenated().to_string()))
    }
}

impl serde::Serialize for ClientId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ClientId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
