//! Galactic store integration tests.
//!
//! A replica bus and a server bus linked by a loopback connection: the
//! server hosts the authoritative store and the store sync service, the
//! replica opens galactic copies of it.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, LoopbackConnection, PUB_PREFIX, TOPIC_PREFIX};
use fabric_bus::bus::EventBus;
use fabric_bus::config::StoreSyncConfig;
use fabric_bus::interfaces::BrokerConnection;
use fabric_bus::services::StoreSyncService;
use fabric_bus::store::{BusStore, StoreChange};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Cluster {
    server: Arc<EventBus>,
    service: Arc<StoreSyncService>,
    authoritative: Arc<BusStore>,
}

async fn cluster() -> Cluster {
    let server = Arc::new(EventBus::default());
    let service = StoreSyncService::new(Arc::clone(&server));
    let _monitor = service.start();
    let authoritative = server.store_manager().create_store("players").await;
    authoritative
        .populate([("ann".to_string(), json!({"score": 1}))].into_iter().collect())
        .await
        .unwrap();
    Cluster {
        server,
        service,
        authoritative,
    }
}

/// Connect a new replica bus and open the `players` store on it.
async fn replica(cluster: &Cluster) -> (Arc<EventBus>, Arc<BusStore>) {
    let bus = Arc::new(EventBus::default());
    let conn = LoopbackConnection::new(Arc::clone(&cluster.server));
    let before = cluster.service.client_count().await;
    // The default store sync prefixes match the loopback's destinations.
    bus.connect_store_sync(conn.clone(), &StoreSyncConfig::default())
        .await
        .unwrap();

    let service = Arc::clone(&cluster.service);
    eventually(|| {
        let service = Arc::clone(&service);
        async move { service.client_count().await == before + 1 }
    })
    .await;

    let store = bus
        .store_manager()
        .open_galactic_store("players", conn.id())
        .await
        .unwrap();
    timeout(Duration::from_secs(1), store.ready())
        .await
        .expect("replica never became ready");
    (bus, store)
}

async fn changes(store: &BusStore) -> mpsc::UnboundedReceiver<StoreChange> {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = store.on_all_changes(&[]);
    stream
        .subscribe(move |change| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(change);
            }
        })
        .await
        .unwrap();
    // Dropping the handle leaves the subscription in place.
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<StoreChange>) -> StoreChange {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for change")
        .expect("change stream closed")
}

#[tokio::test]
async fn test_replica_receives_content() {
    let cluster = cluster().await;
    let (_bus, store) = replica(&cluster).await;

    assert_eq!(store.get("ann").await, Some(json!({"score": 1})));
    assert_eq!(store.version().await, 2);
    assert_eq!(cluster.service.listener_clients("players").await, Some(1));
}

#[tokio::test]
async fn test_replica_write_round_trips_through_owner() {
    let cluster = cluster().await;
    let (_bus, store) = replica(&cluster).await;
    let mut replica_changes = changes(&store).await;

    store.put("bob", json!({"score": 5}), None).await.unwrap();

    let change = next(&mut replica_changes).await;
    assert_eq!(change.id, "bob");
    assert_eq!(change.store_version, 3);
    assert_eq!(store.get("bob").await, Some(json!({"score": 5})));
    assert_eq!(cluster.authoritative.get("bob").await, Some(json!({"score": 5})));
    assert_eq!(cluster.authoritative.version().await, 3);
}

#[tokio::test]
async fn test_owner_writes_reach_every_replica() {
    let cluster = cluster().await;
    let (_a_bus, a) = replica(&cluster).await;
    let (_b_bus, b) = replica(&cluster).await;
    let mut a_changes = changes(&a).await;
    let mut b_changes = changes(&b).await;
    assert_eq!(cluster.service.listener_clients("players").await, Some(2));

    cluster.authoritative.remove("ann", None).await.unwrap();

    assert!(next(&mut a_changes).await.is_delete);
    assert!(next(&mut b_changes).await.is_delete);
    assert_eq!(a.get("ann").await, None);
    assert_eq!(b.get("ann").await, None);
    assert_eq!(a.version().await, cluster.authoritative.version().await);
}

#[tokio::test]
async fn test_closing_replica_keeps_other_in_sync() {
    let cluster = cluster().await;
    let (a_bus, _a) = replica(&cluster).await;
    let (_b_bus, b) = replica(&cluster).await;
    let mut b_changes = changes(&b).await;

    a_bus.store_manager().close_galactic_store("players").await.unwrap();
    let service = Arc::clone(&cluster.service);
    eventually(|| {
        let service = Arc::clone(&service);
        async move { service.listener_clients("players").await == Some(1) }
    })
    .await;

    cluster.authoritative.put("cy", json!({"score": 2}), None).await.unwrap();
    assert_eq!(next(&mut b_changes).await.id, "cy");
}

#[tokio::test]
async fn test_destroying_sync_channel_releases_listener() {
    let cluster = cluster().await;
    let bus = Arc::new(EventBus::default());
    let conn = LoopbackConnection::new(Arc::clone(&cluster.server));
    bus.store_manager()
        .configure_store_sync_channel(conn.clone(), TOPIC_PREFIX, PUB_PREFIX)
        .await
        .unwrap();
    let service = Arc::clone(&cluster.service);
    eventually(|| {
        let service = Arc::clone(&service);
        async move { service.client_count().await == 1 }
    })
    .await;
    let store = bus
        .store_manager()
        .open_galactic_store("players", conn.id())
        .await
        .unwrap();
    timeout(Duration::from_secs(1), store.ready()).await.unwrap();

    // The hosting layer tears the server side down when the peer goes away.
    let channel = bus.store_manager().sync_channel_name(conn.id());
    cluster.server.channel_manager().destroy_channel(&channel).await;

    let service = Arc::clone(&cluster.service);
    eventually(|| {
        let service = Arc::clone(&service);
        async move {
            service.client_count().await == 0 && service.listener_clients("players").await.is_none()
        }
    })
    .await;
}

#[tokio::test]
async fn test_opening_unknown_store_leaves_replica_unready() {
    let cluster = cluster().await;
    let bus = Arc::new(EventBus::default());
    let conn = LoopbackConnection::new(Arc::clone(&cluster.server));
    bus.store_manager()
        .configure_store_sync_channel(conn.clone(), TOPIC_PREFIX, PUB_PREFIX)
        .await
        .unwrap();
    let service = Arc::clone(&cluster.service);
    eventually(|| {
        let service = Arc::clone(&service);
        async move { service.client_count().await == 1 }
    })
    .await;

    let store = bus
        .store_manager()
        .open_galactic_store("nobody", conn.id())
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(100), store.ready()).await.is_err());
}
