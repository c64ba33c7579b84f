//! End-to-end tests for replicas sharing one in-memory channel.
//!
//! Covers replication, version gating across replicas, fetch-on-invalidate
//! coalescing and the resync exchange.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use synced_map::protocol;
use synced_map::{
    Channel, ChangeOrigin, ClientId, FetchError, LocalChannel, MapChange, SyncedMap,
    SyncedMapOptions,
};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

// ============================================================================
// Helpers
// ============================================================================

fn versioned(channel: &LocalChannel) -> SyncedMap<String, Value> {
    SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::<String, Value>::new().version_field("v"),
    )
}

/// Count payloads pushed under `event`.
fn count_pushes(channel: &LocalChannel, event: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = Arc::clone(&count);
    channel.on(
        event,
        Arc::new(move |_: Value| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        }),
    );
    count
}

/// Push an invalidation as if it came from another replica.
fn push_invalidate(channel: &LocalChannel, key: &str) {
    channel.push(
        protocol::INVALIDATE,
        json!({
            "type": "store:invalidate",
            "key": key,
            "source": ClientId::generate(),
        }),
    );
}

/// Poll `condition` until it holds or a second passes.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    timeout(Duration::from_secs(1), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn test_set_and_delete_replicate() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let b: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());

    a.set("x".into(), 1);
    assert_eq!(b.get(&"x".into()), Some(1));

    b.delete(&"x".into());
    assert!(!a.contains_key(&"x".into()));
}

#[test]
fn test_clear_replicates() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let b: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());

    a.set("x".into(), 1).set("y".into(), 2);
    assert_eq!(b.len(), 2);

    b.clear();
    assert!(a.is_empty());
}

#[test]
fn test_remote_writes_do_not_ping_pong() {
    let channel = LocalChannel::new();
    let sets = count_pushes(&channel, protocol::SET);
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let _b: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let _c: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());

    a.set("x".into(), 1);

    assert_eq!(sets.load(Ordering::Relaxed), 1);
}

#[test]
fn test_suspended_writes_stay_local() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let b: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());

    a.suspend_sync(|| {
        for i in 0..100 {
            a.set(format!("k{}", i), i);
        }
    });

    assert_eq!(a.len(), 100);
    assert!(b.is_empty());
}

#[test]
fn test_destroyed_replica_stops_receiving() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let b: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());

    b.destroy();
    a.set("x".into(), 1);

    assert!(b.is_empty());
}

#[test]
fn test_remote_changes_reach_observers() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let b: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let changes = Arc::new(Mutex::new(Vec::new()));
    let changes_clone = Arc::clone(&changes);
    let _sub = b.subscribe(move |change| changes_clone.lock().unwrap().push(change.clone()));

    a.set("x".into(), 1);
    a.delete(&"x".into());

    assert_eq!(
        *changes.lock().unwrap(),
        vec![
            MapChange::Set {
                key: "x".to_string(),
                value: 1,
                origin: ChangeOrigin::Remote,
            },
            MapChange::Deleted {
                key: "x".to_string(),
                origin: ChangeOrigin::Remote,
            },
        ]
    );
}

// ============================================================================
// Versioning
// ============================================================================

#[test]
fn test_equal_version_rejected_and_not_broadcast() {
    let channel = LocalChannel::new();
    let a = versioned(&channel);
    let b = versioned(&channel);
    let sets = count_pushes(&channel, protocol::SET);

    a.set("k".into(), json!({"v": 1, "data": "a"}));
    assert_eq!(b.get(&"k".into()).unwrap()["data"], "a");

    b.set("k".into(), json!({"v": 1, "data": "b"}));

    assert_eq!(b.get(&"k".into()).unwrap()["data"], "a");
    assert_eq!(a.get(&"k".into()).unwrap()["data"], "a");
    assert_eq!(sets.load(Ordering::Relaxed), 1);
}

#[test]
fn test_peer_with_foreign_id_scheme_replicates() {
    let channel = LocalChannel::new();
    let map: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());

    channel.push(
        protocol::SET,
        json!({"type": "store:set", "key": "x", "value": 1, "source": "tab-1"}),
    );
    channel.push(
        protocol::DELETE,
        json!({"type": "store:delete", "key": "x", "source": 42}),
    );

    // A string id is applied; a non-string source is malformed and dropped
    assert_eq!(map.get(&"x".into()), Some(1));
}

#[test]
fn test_out_of_order_delivery_keeps_newest() {
    let channel = LocalChannel::new();
    let b = versioned(&channel);
    let source = ClientId::generate();

    for version in [3, 1, 2] {
        channel.push(
            protocol::SET,
            json!({
                "type": "store:set",
                "key": "k",
                "value": {"v": version},
                "source": source,
            }),
        );
    }

    assert_eq!(b.get(&"k".into()), Some(json!({"v": 3})));
}

#[test]
fn test_version_by_struct_field() {
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Contact {
        name: String,
        updated_at: u64,
    }

    let channel = LocalChannel::new();
    let options = || {
        SyncedMapOptions::<u32, Contact>::new().version_by(|c: &Contact| Some(c.updated_at as f64))
    };
    let a = SyncedMap::new(channel.clone(), options());
    let b = SyncedMap::new(channel.clone(), options());

    a.set(
        7,
        Contact {
            name: "Ada".into(),
            updated_at: 20,
        },
    );
    b.set(
        7,
        Contact {
            name: "Stale".into(),
            updated_at: 10,
        },
    );

    assert_eq!(a.get(&7).unwrap().name, "Ada");
    assert_eq!(b.get(&7).unwrap().name, "Ada");
}

// ============================================================================
// Fetch on invalidate
// ============================================================================

#[tokio::test]
async fn test_invalidate_coalesces_concurrent_fetches() {
    let channel = LocalChannel::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);

    let map = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::<String, Value>::new()
            .version_field("v")
            .fetch_on_invalidate(move |_key: String| {
                calls_clone.fetch_add(1, Ordering::Relaxed);
                async {
                    sleep(Duration::from_millis(20)).await;
                    Ok::<_, FetchError>(json!({"v": 5, "data": "fresh"}))
                }
            }),
    );

    push_invalidate(&channel, "k");
    push_invalidate(&channel, "k");
    assert_eq!(map.pending_fetch_count(), 1);

    assert!(eventually(|| map.get(&"k".into()).is_some()).await);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(map.get(&"k".into()), Some(json!({"v": 5, "data": "fresh"})));
    assert!(eventually(|| map.pending_fetch_count() == 0).await);
}

#[tokio::test]
async fn test_invalidate_after_settle_fetches_again() {
    let channel = LocalChannel::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);

    let map: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new().fetch_on_invalidate(move |_key: String| {
            let n = calls_clone.fetch_add(1, Ordering::Relaxed) as i64;
            async move { Ok::<_, FetchError>(n) }
        }),
    );

    push_invalidate(&channel, "k");
    assert!(eventually(|| map.get(&"k".into()) == Some(0)).await);
    assert!(eventually(|| map.pending_fetch_count() == 0).await);

    push_invalidate(&channel, "k");
    assert!(eventually(|| map.get(&"k".into()) == Some(1)).await);
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_failed_fetch_releases_key() {
    let channel = LocalChannel::new();
    let map: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new()
            .entries([("k".to_string(), 1)])
            .fetch_on_invalidate(|_key: String| async {
                Err::<i64, FetchError>("backend unavailable".into())
            }),
    );

    push_invalidate(&channel, "k");

    assert!(eventually(|| map.pending_fetch_count() == 0).await);
    assert_eq!(map.get(&"k".into()), Some(1));
}

#[tokio::test]
async fn test_own_invalidate_is_ignored() {
    let channel = LocalChannel::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);

    let map: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new().fetch_on_invalidate(move |_key: String| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            async { Ok::<_, FetchError>(1) }
        }),
    );

    map.invalidate(&"k".into());

    assert_eq!(map.pending_fetch_count(), 0);
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_invalidate_reaches_peer_fetcher() {
    let channel = LocalChannel::new();
    let writer: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let reader: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new().fetch_on_invalidate(|_key: String| async { Ok::<_, FetchError>(42) }),
    );

    writer.invalidate(&"answer".into());

    assert!(eventually(|| reader.get(&"answer".into()) == Some(42)).await);
    assert!(!writer.contains_key(&"answer".into()));
}

#[tokio::test]
async fn test_fetch_started_after_local_write_wins() {
    let channel = LocalChannel::new();
    let map = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::<String, Value>::new()
            .version_field("v")
            .entries([("k".to_string(), json!({"v": 10, "data": "seed"}))])
            .fetch_on_invalidate(|_key: String| async {
                Ok::<_, FetchError>(json!({"v": 3, "data": "authoritative"}))
            }),
    );

    push_invalidate(&channel, "k");

    // The fetch began long after version 10, so the older-versioned value lands
    assert!(
        eventually(|| map.get(&"k".into()).is_some_and(|v| v["data"] == "authoritative")).await
    );
}

#[tokio::test]
async fn test_fetch_older_than_stored_version_is_discarded() {
    let channel = LocalChannel::new();
    let far_future = 1e15;
    let map = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::<String, Value>::new()
            .version_field("v")
            .entries([("k".to_string(), json!({"v": far_future, "data": "newest"}))])
            .fetch_on_invalidate(|_key: String| async {
                Ok::<_, FetchError>(json!({"v": 3, "data": "stale"}))
            }),
    );

    push_invalidate(&channel, "k");

    assert!(eventually(|| map.pending_fetch_count() == 0).await);
    assert_eq!(map.get(&"k".into()).unwrap()["data"], "newest");
}

#[tokio::test]
async fn test_destroy_aborts_pending_fetch() {
    let channel = LocalChannel::new();
    let release = Arc::new(Notify::new());
    let release_clone = Arc::clone(&release);

    let map: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new().fetch_on_invalidate(move |_key: String| {
            let release = Arc::clone(&release_clone);
            async move {
                release.notified().await;
                Ok::<_, FetchError>(1)
            }
        }),
    );

    push_invalidate(&channel, "k");
    assert_eq!(map.pending_fetch_count(), 1);

    map.destroy();
    release.notify_waiters();
    sleep(Duration::from_millis(20)).await;

    assert_eq!(map.pending_fetch_count(), 0);
    assert!(map.is_empty());
    assert_eq!(channel.total_handler_count(), 0);
}

#[tokio::test]
async fn test_local_set_during_pending_fetch_applies_immediately() {
    let channel = LocalChannel::new();
    let release = Arc::new(Notify::new());
    let release_clone = Arc::clone(&release);

    let map: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new().fetch_on_invalidate(move |_key: String| {
            let release = Arc::clone(&release_clone);
            async move {
                release.notified().await;
                Ok::<_, FetchError>(2)
            }
        }),
    );

    push_invalidate(&channel, "k");
    map.set("k".into(), 1);
    assert_eq!(map.get(&"k".into()), Some(1));

    // notify_one stores a permit, so the fetch proceeds even if not yet polled
    release.notify_one();
    assert!(eventually(|| map.get(&"k".into()) == Some(2)).await);
}

// ============================================================================
// Resync
// ============================================================================

#[test]
fn test_resync_pulls_existing_state() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    a.set("x".into(), 1).set("y".into(), 2);

    let late: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    assert!(late.is_empty());

    late.request_resync();

    assert_eq!(late.get(&"x".into()), Some(1));
    assert_eq!(late.get(&"y".into()), Some(2));
}

#[test]
fn test_snapshot_only_applies_to_requester() {
    let channel = LocalChannel::new();
    let a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let bystander: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    a.suspend_sync(|| {
        a.set("local-only".into(), 1);
    });

    let late: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    late.request_resync();

    assert_eq!(late.get(&"local-only".into()), Some(1));
    assert!(!bystander.contains_key(&"local-only".into()));
}

#[test]
fn test_resync_respects_versions() {
    let channel = LocalChannel::new();
    let a = versioned(&channel);
    a.suspend_sync(|| {
        a.set("k".into(), json!({"v": 1, "data": "old"}));
    });

    let late = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::<String, Value>::new()
            .version_field("v")
            .entries([("k".to_string(), json!({"v": 2, "data": "new"}))]),
    );
    late.request_resync();

    assert_eq!(late.get(&"k".into()).unwrap()["data"], "new");
}

#[test]
fn test_resync_keeps_local_only_keys() {
    let channel = LocalChannel::new();
    let _a: SyncedMap<String, i64> = SyncedMap::with_channel(channel.clone());
    let late: SyncedMap<String, i64> = SyncedMap::new(
        channel.clone(),
        SyncedMapOptions::new().entries([("mine".to_string(), 1)]),
    );

    late.request_resync();

    assert_eq!(late.get(&"mine".into()), Some(1));
}
