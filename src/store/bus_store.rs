//! Versioned key/value store.
//!
//! A local store owns its version: every committed put or remove bumps it by
//! one. A galactic store is a replica of a store owned by a remote process;
//! writes are forwarded upstream and the replica changes only when the
//! authoritative store echoes the change back.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::stream::{
    ChangeFilter, MutationFilter, MutationRequest, MutationStream, StoreStream, StreamHub,
};
use super::sync::{SyncRequest, SyncResponse, SyncResponseType};
use super::{Result, StoreChange, StoreError};
use crate::bus::{BusMonitor, MonitorEvent};
use crate::interfaces::BrokerConnection;

/// Version of a freshly created or reset store.
pub const INITIAL_VERSION: i64 = 1;

/// Checks an item value before it is written.
pub(crate) type ItemValidator = Arc<dyn Fn(&Value) -> serde_json::Result<()> + Send + Sync>;

/// Build a validator that accepts values deserializable as `T`.
pub(crate) fn validator_for<T: DeserializeOwned + 'static>() -> ItemValidator {
    Arc::new(|value| T::deserialize(value).map(|_| ()))
}

/// Upstream link of a galactic replica.
pub(crate) struct GalacticLink {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    /// Destination sync requests are published to.
    pub(crate) publish_destination: String,
    /// Local sync channel the authoritative store answers on.
    pub(crate) sync_channel: String,
}

struct StoreState {
    items: HashMap<String, Value>,
    version: i64,
    /// Galactic only: updates that arrived before the store content.
    pending: Option<Vec<SyncResponse>>,
}

/// Versioned map of items with change and mutation streams.
pub struct BusStore {
    name: String,
    state: RwLock<StoreState>,
    changes: Arc<StreamHub<StoreChange, ChangeFilter>>,
    mutations: Arc<StreamHub<MutationRequest, MutationFilter>>,
    ready: watch::Sender<bool>,
    galactic: Option<GalacticLink>,
    validator: Option<ItemValidator>,
    monitor: BusMonitor,
}

impl BusStore {
    pub(crate) fn local(
        name: impl Into<String>,
        validator: Option<ItemValidator>,
        monitor: BusMonitor,
    ) -> Self {
        Self::build(name.into(), None, validator, monitor)
    }

    pub(crate) fn galactic(
        name: impl Into<String>,
        link: GalacticLink,
        validator: Option<ItemValidator>,
        monitor: BusMonitor,
    ) -> Self {
        Self::build(name.into(), Some(link), validator, monitor)
    }

    fn build(
        name: String,
        galactic: Option<GalacticLink>,
        validator: Option<ItemValidator>,
        monitor: BusMonitor,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let pending = galactic.as_ref().map(|_| Vec::new());
        Self {
            name,
            state: RwLock::new(StoreState {
                items: HashMap::new(),
                version: INITIAL_VERSION,
                pending,
            }),
            changes: Arc::new(StreamHub::new()),
            mutations: Arc::new(StreamHub::new()),
            ready,
            galactic,
            validator,
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_galactic(&self) -> bool {
        self.galactic.is_some()
    }

    pub(crate) fn sync_channel(&self) -> Option<&str> {
        self.galactic.as_ref().map(|link| link.sync_channel.as_str())
    }

    pub(crate) fn connection_id(&self) -> Option<uuid::Uuid> {
        self.galactic.as_ref().map(|link| link.connection.id())
    }

    pub async fn version(&self) -> i64 {
        self.state.read().await.version
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Write an item.
    ///
    /// On a galactic store this only publishes an update request; the value
    /// becomes visible once the authoritative store echoes it.
    ///
    /// `null` is rejected: on the sync wire it encodes a removal.
    pub async fn put(&self, id: &str, value: impl Serialize, state: Option<&str>) -> Result<()> {
        let value = serde_json::to_value(value)?;
        if value.is_null() {
            return Err(StoreError::InvalidItem {
                store: self.name.clone(),
                item: id.to_string(),
                message: "null is not a storable value, use remove".to_string(),
            });
        }
        self.validate(id, &value)?;

        if self.galactic.is_some() {
            return self
                .publish_upstream(SyncRequest::update_store(&self.name, id, Some(value)))
                .await;
        }

        let mut guard = self.state.write().await;
        guard.items.insert(id.to_string(), value.clone());
        guard.version += 1;
        let change = StoreChange {
            id: id.to_string(),
            value,
            state: state.map(str::to_string),
            is_delete: false,
            store_version: guard.version,
        };
        // Queued under the state lock so streams see commit order.
        self.changes.publish(&change).await;
        debug!(store = %self.name, item = %id, version = guard.version, "Item stored");
        Ok(())
    }

    /// Remove an item. Returns `false` when the item does not exist.
    ///
    /// On a galactic store a removal request is published upstream when the
    /// replica holds the item.
    pub async fn remove(&self, id: &str, state: Option<&str>) -> Result<bool> {
        if self.galactic.is_some() {
            if !self.state.read().await.items.contains_key(id) {
                return Ok(false);
            }
            self.publish_upstream(SyncRequest::update_store(&self.name, id, None))
                .await?;
            return Ok(true);
        }

        let mut guard = self.state.write().await;
        let Some(value) = guard.items.remove(id) else {
            return Ok(false);
        };
        guard.version += 1;
        let change = StoreChange {
            id: id.to_string(),
            value,
            state: state.map(str::to_string),
            is_delete: true,
            store_version: guard.version,
        };
        self.changes.publish(&change).await;
        debug!(store = %self.name, item = %id, version = guard.version, "Item removed");
        Ok(true)
    }

    /// Seed an empty local store and mark it ready.
    pub async fn populate(&self, items: HashMap<String, Value>) -> Result<()> {
        if self.galactic.is_some() {
            return Err(StoreError::GalacticStore(self.name.clone()));
        }
        for (id, value) in &items {
            self.validate(id, value)?;
        }

        {
            let mut guard = self.state.write().await;
            if !guard.items.is_empty() {
                return Err(StoreError::AlreadyPopulated(self.name.clone()));
            }
            guard.items = items;
            guard.version += 1;
            info!(store = %self.name, items = guard.items.len(), version = guard.version, "Store populated");
        }
        self.mark_ready();
        Ok(())
    }

    /// Mark the store ready without seeding it.
    pub fn initialize(&self) {
        self.mark_ready();
    }

    /// Clear items and streams, and re-arm readiness.
    ///
    /// A galactic replica asks the authoritative store for its content again.
    pub async fn reset(&self) -> Result<()> {
        {
            let mut guard = self.state.write().await;
            guard.items.clear();
            guard.version = INITIAL_VERSION;
            guard.pending = self.galactic.as_ref().map(|_| Vec::new());
        }
        self.changes.clear().await;
        self.mutations.clear().await;
        self.ready.send_replace(false);
        info!(store = %self.name, "Store reset");

        if self.galactic.is_some() {
            self.open_upstream().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Option<Value> {
        self.state.read().await.items.get(id).cloned()
    }

    /// Read an item as `T`. `Ok(None)` when the item does not exist.
    pub async fn get_as<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        match self.get(id).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Snapshot of all values, ordered by item id.
    pub async fn all_values(&self) -> Vec<Value> {
        let guard = self.state.read().await;
        let mut entries: Vec<(&String, &Value)> = guard.items.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Snapshot of all values as `T`, ordered by item id.
    pub async fn all_values_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.all_values()
            .await
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    pub async fn all_values_as_map(&self) -> HashMap<String, Value> {
        self.state.read().await.items.clone()
    }

    /// Snapshot of all items together with the version they belong to.
    pub async fn all_values_and_version(&self) -> (HashMap<String, Value>, i64) {
        let guard = self.state.read().await;
        (guard.items.clone(), guard.version)
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    /// Changes to one item, optionally restricted to state tags.
    pub fn on_change(&self, id: &str, states: &[&str]) -> StoreStream {
        StoreStream::new(
            ChangeFilter {
                item_id: Some(id.to_string()),
                states: states.iter().map(|s| s.to_string()).collect(),
            },
            Arc::clone(&self.changes),
        )
    }

    /// Changes to any item, optionally restricted to state tags.
    pub fn on_all_changes(&self, states: &[&str]) -> StoreStream {
        StoreStream::new(
            ChangeFilter {
                item_id: None,
                states: states.iter().map(|s| s.to_string()).collect(),
            },
            Arc::clone(&self.changes),
        )
    }

    /// Mutation requests of the given types, or of every type when empty.
    pub fn on_mutation_request(&self, types: &[&str]) -> MutationStream {
        MutationStream::new(
            MutationFilter {
                types: types.iter().map(|s| s.to_string()).collect(),
            },
            Arc::clone(&self.mutations),
        )
    }

    /// Broadcast a mutation request to every matching mutation stream.
    ///
    /// Returns how many streams received it. Each stream answers on its own.
    pub async fn mutate<S, E>(
        &self,
        request: impl Serialize,
        request_type: &str,
        on_success: S,
        on_error: E,
    ) -> Result<usize>
    where
        S: Fn(Value) + Send + Sync + 'static,
        E: Fn(Value) + Send + Sync + 'static,
    {
        let request = MutationRequest::new(
            serde_json::to_value(request)?,
            request_type,
            Arc::new(on_success),
            Arc::new(on_error),
        );
        let receivers = self.mutations.publish(&request).await;
        debug!(store = %self.name, request_type, receivers, "Mutation requested");
        Ok(receivers)
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolve once the store is ready.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run `f` on its own task once the store is ready.
    pub fn when_ready<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut rx = self.ready.subscribe();
        tokio::spawn(async move {
            if rx.wait_for(|ready| *ready).await.is_ok() {
                f();
            }
        });
    }

    fn mark_ready(&self) {
        if !self.ready.send_replace(true) {
            info!(store = %self.name, "Store ready");
            self.monitor.emit(MonitorEvent::StoreInitialized {
                store: self.name.clone(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Galactic replica
    // ------------------------------------------------------------------------

    pub(crate) async fn open_upstream(&self) -> Result<()> {
        self.publish_upstream(SyncRequest::open_store(&self.name)).await
    }

    pub(crate) async fn close_upstream(&self) -> Result<()> {
        self.publish_upstream(SyncRequest::close_store(&self.name))
            .await
    }

    async fn publish_upstream(&self, request: SyncRequest) -> Result<()> {
        let Some(link) = &self.galactic else {
            return Ok(());
        };
        let payload = serde_json::to_value(&request)?;
        link.connection
            .send_json_message(&link.publish_destination, &payload)
            .await
            .map_err(crate::bus::BusError::from)?;
        debug!(store = %self.name, request = %request.request, "Sync request published");
        Ok(())
    }

    /// Apply a message from the authoritative store.
    pub(crate) async fn apply_sync_response(&self, response: SyncResponse) {
        if response.store_id != self.name {
            debug!(store = %self.name, other = %response.store_id, "Sync response for another store ignored");
            return;
        }

        match response.response_type {
            SyncResponseType::StoreContentResponse => self.apply_content(response).await,
            SyncResponseType::UpdateStoreResponse => {
                let mut guard = self.state.write().await;
                if let Some(pending) = guard.pending.as_mut() {
                    pending.push(response);
                    return;
                }
                self.apply_update(&mut guard, response).await;
            }
            SyncResponseType::Error => {
                warn!(
                    store = %self.name,
                    error = response.error_message.as_deref().unwrap_or_default(),
                    "Authoritative store rejected request"
                );
            }
        }
    }

    async fn apply_content(&self, response: SyncResponse) {
        {
            let mut guard = self.state.write().await;
            guard.items = response.items.unwrap_or_default();
            guard.version = response.store_version.unwrap_or(INITIAL_VERSION);
            let buffered = guard.pending.take().unwrap_or_default();
            for update in buffered {
                self.apply_update(&mut guard, update).await;
            }
            info!(store = %self.name, items = guard.items.len(), version = guard.version, "Replica content received");
        }
        self.mark_ready();
    }

    async fn apply_update(&self, state: &mut StoreState, update: SyncResponse) {
        let (Some(item_id), Some(version)) = (update.item_id, update.store_version) else {
            warn!(store = %self.name, "Malformed update response ignored");
            return;
        };
        if version <= state.version {
            debug!(store = %self.name, version, current = state.version, "Stale update ignored");
            return;
        }

        let change = if update.new_item_value.is_null() {
            let Some(value) = state.items.remove(&item_id) else {
                state.version = version;
                return;
            };
            StoreChange {
                id: item_id,
                value,
                state: None,
                is_delete: true,
                store_version: version,
            }
        } else {
            state
                .items
                .insert(item_id.clone(), update.new_item_value.clone());
            StoreChange {
                id: item_id,
                value: update.new_item_value,
                state: None,
                is_delete: false,
                store_version: version,
            }
        };
        state.version = version;
        self.changes.publish(&change).await;
    }

    fn validate(&self, id: &str, value: &Value) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator(value).map_err(|e| StoreError::InvalidItem {
                store: self.name.clone(),
                item: id.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusStore")
            .field("name", &self.name)
            .field("galactic", &self.is_galactic())
            .field("ready", &self.is_ready())
            .finish()
    }
}
