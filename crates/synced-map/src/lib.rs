//! synced-map: an observable key/value replica kept convergent over a
//! publish/subscribe channel.
//!
//! This crate provides:
//! - [`SyncedMap`]: the replica, with last-writer-wins by optional version,
//!   self-echo suppression, scoped sync suspension and fetch-on-invalidate
//! - [`Channel`]: the pub/sub abstraction replicas talk over, and
//!   [`LocalChannel`], an in-process implementation
//! - [`StoreEvent`]: the JSON wire protocol (`store:set`, `store:delete`, ...)
//! - [`Subscription`]/[`MapChange`]: change notification for observers

pub mod channel;
pub mod client_id;
pub mod map;
pub mod observe;
pub mod options;
pub mod protocol;

pub use channel::{Channel, Handler, LocalChannel, SubscriptionId};
pub use client_id::{ClientId, ClientIdError};
pub use map::SyncedMap;
pub use observe::{ChangeOrigin, MapChange, Observers, Subscription};
pub use options::{FetchError, MapKey, MapValue, SyncedMapOptions};
pub use protocol::{ProtocolError, StoreEvent};
