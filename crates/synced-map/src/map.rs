//! SyncedMap: a key/value replica kept convergent over a [`Channel`].
//!
//! Local writes are applied first and then broadcast to the other replicas
//! on the channel. Events from peers are applied without re-broadcasting,
//! and a replica drops its own events when the channel echoes them back.
//!
//! With a version selector configured, a write (local or remote) only lands
//! if its version is strictly greater than the stored one, a missing entry
//! counting as version 0. Without one, the last applied write wins.
//!
//! ```text
//!   replica A                 channel                 replica B
//!   ─────────                 ───────                 ─────────
//!   set(k, v) ─apply─► entries
//!             ─push store:set {k, v, source: A}──► handler: source != B
//!                                                     └─apply (version-gated)
//!   handler: source == A ◄── echo
//!     └─ dropped
//! ```

use crate::channel::{Channel, Handler, SubscriptionId};
use crate::client_id::ClientId;
use crate::observe::{ChangeOrigin, MapChange, Observers, Subscription};
use crate::options::{FetchError, Fetcher, MapKey, MapValue, SyncedMapOptions, VersionSelector};
use crate::protocol::{self, StoreEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

struct State<K, V> {
    entries: HashMap<K, V>,
    /// Keys with a refresh fetch in flight. The abort handle is filled in
    /// once the fetch task has been spawned.
    pending_fetches: HashMap<K, Option<AbortHandle>>,
    /// Depth of nested `suspend_sync` scopes.
    suspend_depth: usize,
    destroyed: bool,
    subscriptions: Vec<(&'static str, SubscriptionId)>,
}

impl<K, V> State<K, V> {
    fn may_broadcast(&self) -> bool {
        self.suspend_depth == 0 && !self.destroyed
    }
}

struct Shared<K, V> {
    client_id: ClientId,
    channel: Arc<dyn Channel>,
    version: Option<VersionSelector<V>>,
    fetcher: Option<Fetcher<K, V>>,
    runtime: Option<Handle>,
    state: Mutex<State<K, V>>,
    observers: Arc<Observers<MapChange<K, V>>>,
}

impl<K, V> Shared<K, V> {
    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Observable key/value map replicated over a channel.
///
/// Dropping the map calls [`destroy`](Self::destroy).
pub struct SyncedMap<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K: MapKey, V: MapValue> SyncedMap<K, V> {
    /// Create a replica bound to `channel`.
    ///
    /// Seeds the entries from `options` without broadcasting and subscribes
    /// to the replication events (plus `store:invalidate` when a fetcher is
    /// configured).
    pub fn new(channel: impl Channel + 'static, options: SyncedMapOptions<K, V>) -> Self {
        let SyncedMapOptions {
            version,
            entries,
            fetcher,
            runtime,
        } = options;

        let shared = Arc::new(Shared {
            client_id: ClientId::generate(),
            channel: Arc::new(channel),
            version,
            fetcher,
            runtime,
            state: Mutex::new(State {
                entries: entries.into_iter().collect(),
                pending_fetches: HashMap::new(),
                suspend_depth: 0,
                destroyed: false,
                subscriptions: Vec::new(),
            }),
            observers: Arc::new(Observers::new()),
        });

        let mut events = protocol::REPLICATION_EVENTS.to_vec();
        if shared.fetcher.is_some() {
            events.push(protocol::INVALIDATE);
        }

        let subscriptions = events
            .into_iter()
            .map(|event| {
                let weak = Arc::downgrade(&shared);
                let handler: Handler = Arc::new(move |payload: Value| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_remote(event, payload);
                    }
                });
                (event, shared.channel.on(event, handler))
            })
            .collect();
        shared.lock().subscriptions = subscriptions;

        debug!(
            "Synced map {} created with {} seeded entries",
            shared.client_id,
            shared.lock().entries.len()
        );

        Self { shared }
    }

    /// Create an empty replica with default options.
    pub fn with_channel(channel: impl Channel + 'static) -> Self {
        Self::new(channel, SyncedMapOptions::new())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shared.lock().entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }

    /// Keys in unspecified order.
    pub fn keys(&self) -> Vec<K> {
        self.shared.lock().entries.keys().cloned().collect()
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.shared.lock().entries.clone()
    }

    /// Insert or replace `key`, then broadcast `store:set`.
    ///
    /// A write whose version is not newer than the stored one is a silent
    /// no-op: nothing changes, nothing is notified or broadcast.
    pub fn set(&self, key: K, value: V) -> &Self {
        let shared = &self.shared;
        let Some(broadcast) = shared.commit_set(&key, &value, ChangeOrigin::Local, None) else {
            trace!("Rejected stale local write");
            return self;
        };

        if broadcast {
            shared.broadcast(&StoreEvent::Set {
                key,
                value,
                source: shared.client_id.clone(),
            });
        }
        self
    }

    /// Remove `key`, then broadcast `store:delete`.
    ///
    /// Returns whether the key was present.
    pub fn delete(&self, key: &K) -> bool {
        let shared = &self.shared;
        let (removed, broadcast) = {
            let mut state = shared.lock();
            (state.entries.remove(key).is_some(), state.may_broadcast())
        };

        if removed {
            shared.notify(MapChange::Deleted {
                key: key.clone(),
                origin: ChangeOrigin::Local,
            });
        }
        if broadcast {
            shared.broadcast(&StoreEvent::Delete {
                key: key.clone(),
                source: shared.client_id.clone(),
            });
        }
        removed
    }

    /// Remove every entry, then broadcast `store:clear`.
    pub fn clear(&self) {
        let shared = &self.shared;
        let (had_entries, broadcast) = {
            let mut state = shared.lock();
            let had_entries = !state.entries.is_empty();
            state.entries.clear();
            (had_entries, state.may_broadcast())
        };

        if had_entries {
            shared.notify(MapChange::Cleared {
                origin: ChangeOrigin::Local,
            });
        }
        if broadcast {
            shared.broadcast(&StoreEvent::Clear {
                source: shared.client_id.clone(),
            });
        }
    }

    /// Ask peers with a fetcher to refresh `key` from its authoritative source.
    pub fn invalidate(&self, key: &K) {
        let shared = &self.shared;
        if !shared.lock().may_broadcast() {
            return;
        }
        shared.broadcast(&StoreEvent::Invalidate {
            key: key.clone(),
            source: shared.client_id.clone(),
        });
    }

    /// Ask every peer for its full state.
    ///
    /// Each peer answers with a snapshot addressed to this replica; its
    /// entries are merged through the version gate. Local keys missing from
    /// a snapshot are kept.
    pub fn request_resync(&self) {
        let shared = &self.shared;
        if !shared.lock().may_broadcast() {
            return;
        }
        debug!("Synced map {} requesting resync", shared.client_id);
        shared.broadcast(&StoreEvent::Resync {
            source: shared.client_id.clone(),
        });
    }

    /// Observe committed mutations. Drop the subscription to stop.
    pub fn subscribe(
        &self,
        callback: impl Fn(&MapChange<K, V>) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.observers.subscribe(callback)
    }

    /// Number of refresh fetches currently in flight.
    pub fn pending_fetch_count(&self) -> usize {
        self.shared.lock().pending_fetches.len()
    }
}

impl<K, V> SyncedMap<K, V> {
    pub fn client_id(&self) -> ClientId {
        self.shared.client_id.clone()
    }

    /// Run `f` with broadcasting suspended.
    ///
    /// Mutations made inside `f` are applied locally but never broadcast.
    /// Broadcasting resumes on every exit path, including a panic in `f`.
    pub fn suspend_sync<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = SuspendGuard::new(&self.shared);
        f()
    }

    pub fn is_sync_suspended(&self) -> bool {
        self.shared.lock().suspend_depth > 0
    }

    /// Deregister every channel handler and abort in-flight fetches.
    ///
    /// Later calls are no-ops. Local reads and writes keep working but are
    /// no longer broadcast, and nothing from the channel is applied.
    pub fn destroy(&self) {
        let (subscriptions, fetches) = {
            let mut state = self.shared.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let fetches: Vec<AbortHandle> = state
                .pending_fetches
                .drain()
                .filter_map(|(_, handle)| handle)
                .collect();
            (std::mem::take(&mut state.subscriptions), fetches)
        };

        for (event, id) in subscriptions {
            self.shared.channel.off(event, id);
        }
        for handle in &fetches {
            handle.abort();
        }

        debug!(
            "Synced map {} destroyed ({} fetch(es) aborted)",
            self.shared.client_id,
            fetches.len()
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }
}

impl<K, V> Drop for SyncedMap<K, V> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<K, V> fmt::Debug for SyncedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SyncedMap")
            .field("client_id", &self.shared.client_id)
            .field("len", &state.entries.len())
            .field("pending_fetches", &state.pending_fetches.len())
            .field("sync_suspended", &(state.suspend_depth > 0))
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

struct SuspendGuard<'a, K, V> {
    shared: &'a Shared<K, V>,
}

impl<'a, K, V> SuspendGuard<'a, K, V> {
    fn new(shared: &'a Shared<K, V>) -> Self {
        shared.lock().suspend_depth += 1;
        Self { shared }
    }
}

impl<K, V> Drop for SuspendGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.suspend_depth = state.suspend_depth.saturating_sub(1);
    }
}

impl<K: MapKey, V: MapValue> Shared<K, V> {
    fn version_of(&self, value: &V) -> Option<f64> {
        self.version.as_ref().and_then(|select| select(value))
    }

    fn current_version(&self, current: Option<&V>) -> f64 {
        current.and_then(|value| self.version_of(value)).unwrap_or(0.0)
    }

    /// Version gate shared by local and remote writes.
    fn accepts(&self, current: Option<&V>, incoming: &V) -> bool {
        if self.version.is_none() {
            return true;
        }
        match self.version_of(incoming) {
            Some(incoming) => incoming > self.current_version(current),
            None => true,
        }
    }

    /// Commit `value` if it passes the version gate.
    ///
    /// `fetch_started_at` additionally admits a refreshed value when the
    /// fetch began after the stored version. Returns `None` if rejected,
    /// otherwise whether the change may be broadcast.
    fn commit_set(
        &self,
        key: &K,
        value: &V,
        origin: ChangeOrigin,
        fetch_started_at: Option<f64>,
    ) -> Option<bool> {
        let broadcast = {
            let mut state = self.lock();
            if state.destroyed && origin != ChangeOrigin::Local {
                return None;
            }

            let current = state.entries.get(key);
            let accepted = self.accepts(current, value)
                || fetch_started_at.is_some_and(|at| at > self.current_version(current));
            if !accepted {
                return None;
            }

            state.entries.insert(key.clone(), value.clone());
            state.may_broadcast()
        };

        self.notify(MapChange::Set {
            key: key.clone(),
            value: value.clone(),
            origin,
        });
        Some(broadcast)
    }

    fn notify(&self, change: MapChange<K, V>) {
        self.observers.emit(&change);
    }

    fn broadcast(&self, event: &StoreEvent<K, V>) {
        match event.to_payload() {
            Ok(payload) => {
                trace!("Broadcasting {} from {}", event.name(), self.client_id);
                self.channel.push(event.name(), payload);
            }
            Err(e) => warn!("Dropping outgoing event: {}", e),
        }
    }

    /// Entry point for every channel handler.
    fn on_remote(self: &Arc<Self>, event: &str, payload: Value) {
        let event = match StoreEvent::<K, V>::decode(event, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed {} payload: {}", event, e);
                return;
            }
        };

        if *event.source() == self.client_id {
            trace!("Ignoring own {} echo", event.name());
            return;
        }

        match event {
            StoreEvent::Set { key, value, .. } => {
                if self
                    .commit_set(&key, &value, ChangeOrigin::Remote, None)
                    .is_none()
                {
                    trace!("Rejected stale remote write");
                }
            }
            StoreEvent::Delete { key, .. } => self.apply_remote_delete(key),
            StoreEvent::Clear { source } => self.apply_remote_clear(source),
            StoreEvent::Invalidate { key, source } => self.refresh(key, source),
            StoreEvent::Resync { source } => self.answer_resync(source),
            StoreEvent::Snapshot {
                entries,
                target,
                source,
            } => {
                if target == self.client_id {
                    self.merge_snapshot(entries, source);
                }
            }
        }
    }

    fn apply_remote_delete(&self, key: K) {
        let removed = {
            let mut state = self.lock();
            !state.destroyed && state.entries.remove(&key).is_some()
        };
        if removed {
            self.notify(MapChange::Deleted {
                key,
                origin: ChangeOrigin::Remote,
            });
        }
    }

    fn apply_remote_clear(&self, source: ClientId) {
        let had_entries = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            let had_entries = !state.entries.is_empty();
            state.entries.clear();
            had_entries
        };
        if had_entries {
            debug!("Synced map {} cleared by {}", self.client_id, source);
            self.notify(MapChange::Cleared {
                origin: ChangeOrigin::Remote,
            });
        }
    }

    /// Re-fetch `key` after a peer invalidated it, at most once at a time.
    fn refresh(self: &Arc<Self>, key: K, source: ClientId) {
        let Some(fetcher) = self.fetcher.clone() else {
            return;
        };
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!("Invalidation from {} ignored: no tokio runtime to fetch on", source);
            return;
        };

        {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            if state.pending_fetches.contains_key(&key) {
                debug!("Invalidation from {} coalesced into pending fetch", source);
                return;
            }
            state.pending_fetches.insert(key.clone(), None);
        }

        let fetch_started_at = now_millis();
        let fetch = fetcher(key.clone());

        // Spawn under the lock so the task cannot settle before its abort
        // handle is recorded.
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        let weak = Arc::downgrade(self);
        let task_key = key.clone();
        let task = runtime.spawn(async move {
            let result = fetch.await;
            if let Some(shared) = weak.upgrade() {
                shared.finish_refresh(task_key, fetch_started_at, result);
            }
        });
        if let Some(slot) = state.pending_fetches.get_mut(&key) {
            *slot = Some(task.abort_handle());
        }
    }

    /// Apply a settled fetch, then release `key`.
    ///
    /// The key stays reserved until the value is committed, so an
    /// invalidation arriving meanwhile is still coalesced.
    fn finish_refresh(&self, key: K, fetch_started_at: f64, result: Result<V, FetchError>) {
        // destroy() has already released every pending key
        if self.lock().destroyed {
            return;
        }

        match result {
            Ok(value) => {
                if self
                    .commit_set(&key, &value, ChangeOrigin::Refresh, Some(fetch_started_at))
                    .is_none()
                {
                    debug!("Discarded refreshed value older than the stored one");
                }
            }
            Err(e) => warn!("Refresh fetch failed, keeping current value: {}", e),
        }

        self.lock().pending_fetches.remove(&key);
    }

    fn answer_resync(&self, requester: ClientId) {
        let entries: Vec<(K, V)> = {
            let state = self.lock();
            if !state.may_broadcast() {
                debug!("Resync request from {} ignored while sync is off", requester);
                return;
            }
            state
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        debug!(
            "Answering resync from {} with {} entries",
            requester,
            entries.len()
        );
        self.broadcast(&StoreEvent::Snapshot {
            entries,
            target: requester,
            source: self.client_id.clone(),
        });
    }

    fn merge_snapshot(&self, entries: Vec<(K, V)>, source: ClientId) {
        let applied: Vec<MapChange<K, V>> = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            let mut applied = Vec::new();
            for (key, value) in entries {
                if !self.accepts(state.entries.get(&key), &value) {
                    continue;
                }
                state.entries.insert(key.clone(), value.clone());
                applied.push(MapChange::Set {
                    key,
                    value,
                    origin: ChangeOrigin::Snapshot,
                });
            }
            applied
        };

        debug!("Merged {} entries from {} snapshot", applied.len(), source);
        for change in &applied {
            self.observers.emit(change);
        }
    }
}

/// Milliseconds since the Unix epoch.
fn now_millis() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}
