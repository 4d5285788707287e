//! BusStore interface step definitions.

use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when, World};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use fabric_bus::bus::EventBus;
use fabric_bus::store::{BusStore, StoreChange, StoreManager, StoreStream};

/// Test context for BusStore scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct BusStoreWorld {
    stores: Arc<StoreManager>,
    store: Option<Arc<BusStore>>,
    listener: Option<StoreStream>,
    changes: Option<mpsc::UnboundedReceiver<StoreChange>>,
    last_removed: Option<bool>,
    last_error: Option<String>,
}

impl BusStoreWorld {
    fn new() -> Self {
        let bus = EventBus::default();
        Self {
            stores: Arc::clone(bus.store_manager()),
            store: None,
            listener: None,
            changes: None,
            last_removed: None,
            last_error: None,
        }
    }

    fn store(&self) -> &Arc<BusStore> {
        self.store.as_ref().expect("No store - call 'Given a local store' first")
    }

    async fn listen(&mut self, stream: StoreStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        stream
            .subscribe(move |change| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(change);
                }
            })
            .await
            .expect("Failed to subscribe");
        self.listener = Some(stream);
        self.changes = Some(rx);
    }

    async fn next_change(&mut self) -> StoreChange {
        let rx = self.changes.as_mut().expect("No change listener");
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Timed out waiting for change")
            .expect("Change stream closed")
    }

    async fn populate(&mut self, id: &str, value: i64) {
        let items = [(id.to_string(), json!(value))].into_iter().collect();
        if let Err(e) = self.store().populate(items).await {
            self.last_error = Some(e.to_string());
        }
    }
}

// --- Given steps ---

#[given(expr = "a local store {string}")]
async fn given_local_store(world: &mut BusStoreWorld, name: String) {
    world.store = Some(world.stores.create_store(&name).await);
}

#[given(expr = "the store is seeded with item {string} = {int}")]
async fn given_seeded(world: &mut BusStoreWorld, id: String, value: i64) {
    world.populate(&id, value).await;
    assert!(world.last_error.is_none(), "Seeding failed: {:?}", world.last_error);
}

#[given("a change listener on all items")]
async fn given_listener_all(world: &mut BusStoreWorld) {
    let stream = world.store().on_all_changes(&[]);
    world.listen(stream).await;
}

#[given(expr = "a change listener on all items with state {string}")]
async fn given_listener_all_with_state(world: &mut BusStoreWorld, state: String) {
    let stream = world.store().on_all_changes(&[state.as_str()]);
    world.listen(stream).await;
}

#[given(expr = "a change listener on item {string} with state {string}")]
async fn given_listener_item(world: &mut BusStoreWorld, id: String, state: String) {
    let stream = world.store().on_change(&id, &[state.as_str()]);
    world.listen(stream).await;
}

// --- When steps ---

#[when(expr = "the store is populated with item {string} = {int}")]
async fn when_populated(world: &mut BusStoreWorld, id: String, value: i64) {
    world.populate(&id, value).await;
}

#[when(expr = "I put item {string} = {int}")]
async fn when_put(world: &mut BusStoreWorld, id: String, value: i64) {
    world
        .store()
        .put(&id, value, None)
        .await
        .expect("Put failed");
}

#[when(expr = "I put item {string} = {int} with state {string}")]
async fn when_put_with_state(world: &mut BusStoreWorld, id: String, value: i64, state: String) {
    world
        .store()
        .put(&id, value, Some(&state))
        .await
        .expect("Put failed");
}

#[when(expr = "I remove item {string}")]
async fn when_remove(world: &mut BusStoreWorld, id: String) {
    let removed = world.store().remove(&id, None).await.expect("Remove failed");
    world.last_removed = Some(removed);
}

#[when("I reset the store")]
async fn when_reset(world: &mut BusStoreWorld) {
    world.store().reset().await.expect("Reset failed");
}

// --- Then steps ---

#[then("the store should be ready")]
fn then_ready(world: &mut BusStoreWorld) {
    assert!(world.store().is_ready());
}

#[then("the store should not be ready")]
fn then_not_ready(world: &mut BusStoreWorld) {
    assert!(!world.store().is_ready());
}

#[then(expr = "the store version should be {int}")]
async fn then_version(world: &mut BusStoreWorld, expected: i64) {
    assert_eq!(world.store().version().await, expected);
}

#[then(expr = "the store should hold {int} items")]
async fn then_item_count(world: &mut BusStoreWorld, expected: usize) {
    let (items, _) = world.store().all_values_and_version().await;
    assert_eq!(items.len(), expected);
}

#[then(expr = "item {string} should be {int}")]
async fn then_item_value(world: &mut BusStoreWorld, id: String, expected: i64) {
    assert_eq!(world.store().get(&id).await, Some(json!(expected)));
}

#[then(expr = "item {string} should not exist")]
async fn then_item_missing(world: &mut BusStoreWorld, id: String) {
    assert_eq!(world.store().get(&id).await, None);
}

#[then("the remove should report true")]
fn then_removed(world: &mut BusStoreWorld) {
    assert_eq!(world.last_removed, Some(true));
}

#[then("the remove should report false")]
fn then_not_removed(world: &mut BusStoreWorld) {
    assert_eq!(world.last_removed, Some(false));
}

#[then(expr = "a change for {string} with value {int} should be received")]
async fn then_change(world: &mut BusStoreWorld, id: String, value: i64) {
    let change = world.next_change().await;
    assert_eq!(change.id, id);
    assert!(!change.is_delete);
    assert_eq!(change.value, Value::from(value));
}

#[then(expr = "a delete change for {string} at version {int} should be received")]
async fn then_delete_change(world: &mut BusStoreWorld, id: String, version: i64) {
    let change = world.next_change().await;
    assert_eq!(change.id, id);
    assert!(change.is_delete);
    assert_eq!(change.store_version, version);
}

#[then("no change should be received")]
async fn then_no_change(world: &mut BusStoreWorld) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let rx = world.changes.as_mut().expect("No change listener");
    assert!(rx.try_recv().is_err(), "Unexpected change received");
}

#[then(expr = "the operation should fail with {string}")]
fn then_failed(world: &mut BusStoreWorld, fragment: String) {
    let error = world.last_error.as_deref().expect("Expected an error");
    assert!(
        error.contains(&fragment),
        "Error '{}' does not mention '{}'",
        error,
        fragment
    );
}
