//! Channel trait for publishing map events to other replicas.
//!
//! Implementations:
//! - [`LocalChannel`]: in-process hub with synchronous dispatch
//! - `WsChannel` (sync-relay crate): WebSocket client of the relay server
//!
//! Delivery is fire-and-forget. A channel gives no acknowledgement and
//! no retry; the map inherits whatever ordering the channel provides.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Callback invoked with the payload of every event pushed under a name.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handle returned by [`Channel::on`], used to deregister the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Publish/subscribe channel shared by the replicas of a map.
pub trait Channel: Send + Sync {
    /// Publish `payload` under `event` to every subscriber of that name.
    fn push(&self, event: &str, payload: Value);

    /// Register `handler` for `event`.
    fn on(&self, event: &str, handler: Handler) -> SubscriptionId;

    /// Deregister a handler. Unknown ids are ignored.
    fn off(&self, event: &str, id: SubscriptionId);
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn push(&self, event: &str, payload: Value) {
        (**self).push(event, payload)
    }

    fn on(&self, event: &str, handler: Handler) -> SubscriptionId {
        (**self).on(event, handler)
    }

    fn off(&self, event: &str, id: SubscriptionId) {
        (**self).off(event, id)
    }
}

#[derive(Default)]
struct Registry {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

/// In-process channel: `push` runs every matching handler before returning.
///
/// Cloning yields another handle to the same hub, so maps built from
/// clones of one `LocalChannel` replicate to each other. The pushing
/// replica's own handlers are invoked too.
#[derive(Clone, Default)]
pub struct LocalChannel {
    registry: Arc<Registry>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.registry
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Number of handlers registered across all events.
    pub fn total_handler_count(&self) -> usize {
        self.registry
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Channel for LocalChannel {
    fn push(&self, event: &str, payload: Value) {
        // Clone the handler list so handlers may call on/off/push themselves.
        let handlers: Vec<Handler> = self
            .registry
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!("push {} to {} handler(s)", event, handlers.len());

        for handler in handlers {
            handler(payload.clone());
        }
    }

    fn on(&self, event: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn off(&self, event: &str, id: SubscriptionId) {
        let mut handlers = self
            .registry
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = handlers.get_mut(event) {
            subs.retain(|(i, _)| *i != id);
            if subs.is_empty() {
                handlers.remove(event);
            }
        }
    }
}
