//! Construction options for [`SyncedMap`](crate::SyncedMap).

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Error returned by a fetch-on-invalidate callback.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Extracts the version used for last-writer-wins from a value.
pub type VersionSelector<V> = Arc<dyn Fn(&V) -> Option<f64> + Send + Sync>;

/// Fetches the authoritative value of a key after a peer invalidated it.
pub type Fetcher<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, FetchError>> + Send + Sync>;

/// Bounds every key of a synced map satisfies.
pub trait MapKey: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapKey for T where T: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Bounds every value of a synced map satisfies.
pub trait MapValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Options recognised when constructing a map.
///
/// ```
/// use synced_map::{LocalChannel, SyncedMap, SyncedMapOptions};
/// use serde_json::{Value, json};
///
/// let options = SyncedMapOptions::<String, Value>::new()
///     .version_field("v")
///     .entries([("k".to_string(), json!({"v": 1}))]);
/// let map = SyncedMap::new(LocalChannel::new(), options);
/// assert_eq!(map.len(), 1);
/// ```
pub struct SyncedMapOptions<K, V> {
    pub(crate) version: Option<VersionSelector<V>>,
    pub(crate) entries: Vec<(K, V)>,
    pub(crate) fetcher: Option<Fetcher<K, V>>,
    pub(crate) runtime: Option<Handle>,
}

impl<K, V> Default for SyncedMapOptions<K, V> {
    fn default() -> Self {
        Self {
            version: None,
            entries: Vec::new(),
            fetcher: None,
            runtime: None,
        }
    }
}

impl<K: MapKey, V: MapValue> SyncedMapOptions<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate writes on a version: a write lands only if its version is
    /// strictly greater than the stored one. Values whose selector returns
    /// `None` are always written.
    pub fn version_by(mut self, selector: impl Fn(&V) -> Option<f64> + Send + Sync + 'static) -> Self {
        let selector: VersionSelector<V> = Arc::new(selector);
        self.version = Some(selector);
        self
    }

    /// Seed the map. Seeded entries are adopted state and never broadcast.
    pub fn entries(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// React to `store:invalidate` from peers by re-fetching the key.
    ///
    /// Without a fetcher the map does not subscribe to invalidations at all.
    pub fn fetch_on_invalidate<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let fetcher: Fetcher<K, V> = Arc::new(move |key| fetch(key).boxed());
        self.fetcher = Some(fetcher);
        self
    }

    /// Runtime that refresh fetches are spawned on.
    ///
    /// Defaults to the runtime current when the invalidation arrives.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

impl<K: MapKey> SyncedMapOptions<K, Value> {
    /// Gate writes on a numeric field of JSON values (e.g. `"v"`).
    pub fn version_field(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.version_by(move |value: &Value| value.get(&field).and_then(Value::as_f64))
    }
}
