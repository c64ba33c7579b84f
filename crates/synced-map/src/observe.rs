//! Change notification for map observers.
//!
//! The map owns an [`Observers`] registry and emits one [`MapChange`] per
//! applied mutation, after the mutation is committed and the map's lock
//! is released. Observers may therefore read the map from inside a callback.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Where an applied mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrigin {
    /// A call on this replica (`set`, `delete`, `clear`).
    Local,
    /// A `store:set`, `store:delete` or `store:clear` from a peer.
    Remote,
    /// A value fetched after a peer invalidated the key.
    Refresh,
    /// An entry merged from a peer's snapshot during resync.
    Snapshot,
}

/// A committed mutation of a synced map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MapChange<K, V> {
    Set { key: K, value: V, origin: ChangeOrigin },
    Deleted { key: K, origin: ChangeOrigin },
    Cleared { origin: ChangeOrigin },
}

impl<K, V> MapChange<K, V> {
    pub fn origin(&self) -> ChangeOrigin {
        match self {
            Self::Set { origin, .. } | Self::Deleted { origin, .. } | Self::Cleared { origin } => {
                *origin
            }
        }
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving changes; drop it to stop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Callback registry for one event type. Wrap in `Arc` to subscribe.
pub struct Observers<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let registry: Weak<dyn Unsubscribe> = Arc::downgrade(self) as Weak<dyn Unsubscribe>;
        Subscription { registry, id }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &E) {
        // Clone the callback list so a callback may subscribe or unsubscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Unsubscribe for Observers<E> {
    fn unsubscribe(&self, id: usize) {
        // emit never holds the lock while callbacks run, so blocking here is safe
        // even when a callback drops its own Subscription.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}
