//! Store registry.
//!
//! Owns the local stores of one bus and the galactic replicas opened through
//! remote connections. Each remote connection gets one sync channel named
//! `<prefix><connection id>`; the authoritative stores answer replicas on it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus_store::{validator_for, BusStore, GalacticLink, ItemValidator};
use super::sync::SyncResponse;
use super::{Result, StoreError};
use crate::bus::{handler_fn, BusMonitor, ChannelManager, Direction, Message, MessageFilter, MonitorEvent};
use crate::interfaces::BrokerConnection;

/// Sync channel set up for one remote connection.
struct SyncChannelConfig {
    channel: String,
    pub_prefix: String,
    connection: Arc<dyn BrokerConnection>,
}

/// Registry of stores.
pub struct StoreManager {
    stores: RwLock<HashMap<String, Arc<BusStore>>>,
    sync_channels: RwLock<HashMap<Uuid, SyncChannelConfig>>,
    channels: Arc<ChannelManager>,
    monitor: BusMonitor,
    sync_channel_prefix: String,
}

impl StoreManager {
    pub fn new(
        channels: Arc<ChannelManager>,
        monitor: BusMonitor,
        sync_channel_prefix: impl Into<String>,
    ) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            sync_channels: RwLock::new(HashMap::new()),
            channels,
            monitor,
            sync_channel_prefix: sync_channel_prefix.into(),
        }
    }

    /// Prefix shared by every store sync channel name.
    pub fn sync_channel_prefix(&self) -> &str {
        &self.sync_channel_prefix
    }

    /// Name of the sync channel for a remote connection.
    pub fn sync_channel_name(&self, connection_id: Uuid) -> String {
        format!("{}{}", self.sync_channel_prefix, connection_id)
    }

    // ------------------------------------------------------------------------
    // Local stores
    // ------------------------------------------------------------------------

    /// Create a local store, or return the existing store with that name.
    pub async fn create_store(&self, name: &str) -> Arc<BusStore> {
        self.create_local(name, None).await
    }

    /// Like [`StoreManager::create_store`], rejecting values that do not
    /// deserialize as `T`.
    pub async fn create_store_with_type<T: DeserializeOwned + 'static>(
        &self,
        name: &str,
    ) -> Arc<BusStore> {
        self.create_local(name, Some(validator_for::<T>())).await
    }

    async fn create_local(&self, name: &str, validator: Option<ItemValidator>) -> Arc<BusStore> {
        let store = {
            let mut stores = self.stores.write().await;
            if let Some(existing) = stores.get(name) {
                return Arc::clone(existing);
            }
            let store = Arc::new(BusStore::local(name, validator, self.monitor.clone()));
            stores.insert(name.to_string(), Arc::clone(&store));
            store
        };

        info!(store = %name, "Store created");
        self.monitor.emit(MonitorEvent::StoreCreated {
            store: name.to_string(),
        });
        store
    }

    pub async fn get_store(&self, name: &str) -> Result<Arc<BusStore>> {
        self.stores
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::StoreNotFound(name.to_string()))
    }

    pub async fn check_store_exists(&self, name: &str) -> bool {
        self.stores.read().await.contains_key(name)
    }

    /// Names of all stores, sorted.
    pub async fn list_stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Destroy a store. Destroying an unknown store is a no-op.
    ///
    /// A galactic replica leaves the replica set of its authoritative store.
    pub async fn destroy_store(&self, name: &str) {
        let removed = self.stores.write().await.remove(name);
        let Some(store) = removed else {
            debug!(store = %name, "Destroy of unknown store ignored");
            return;
        };

        if store.is_galactic() {
            if let Err(e) = store.close_upstream().await {
                warn!(store = %name, error = %e, "Close store request failed");
            }
        }
        info!(store = %name, "Store destroyed");
        self.monitor.emit(MonitorEvent::StoreDestroyed {
            store: name.to_string(),
        });
    }

    // ------------------------------------------------------------------------
    // Galactic replicas
    // ------------------------------------------------------------------------

    /// Set up the sync channel for a remote connection.
    ///
    /// The channel is bound to `<topic_prefix><channel>` on the connection;
    /// replicas publish requests to `<pub_prefix><channel>`. Configuring the
    /// same connection again returns the existing channel name.
    pub async fn configure_store_sync_channel(
        self: &Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
        topic_prefix: &str,
        pub_prefix: &str,
    ) -> Result<String> {
        let connection_id = connection.id();
        if let Some(config) = self.sync_channels.read().await.get(&connection_id) {
            return Ok(config.channel.clone());
        }

        let channel = self.sync_channel_name(connection_id);
        self.channels.create_channel(&channel).await;

        let manager: Weak<Self> = Arc::downgrade(self);
        let callback = handler_fn(move |msg: Arc<Message>| {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.route_sync_message(&msg).await;
                }
            }
        });
        self.channels
            .subscribe_handler(
                &channel,
                MessageFilter::directions(&[Direction::Response, Direction::Error]),
                callback,
                false,
            )
            .await?;

        let destination = format!("{topic_prefix}{channel}");
        self.channels
            .mark_channel_as_galactic(&channel, &destination, Arc::clone(&connection))
            .await?;

        self.sync_channels.write().await.insert(
            connection_id,
            SyncChannelConfig {
                channel: channel.clone(),
                pub_prefix: pub_prefix.to_string(),
                connection,
            },
        );
        info!(channel = %channel, connection = %connection_id, "Store sync channel configured");
        Ok(channel)
    }

    /// Tear down a connection's sync channel and every replica opened on it.
    pub async fn destroy_store_sync_channel(&self, connection_id: Uuid) {
        let Some(config) = self.sync_channels.write().await.remove(&connection_id) else {
            debug!(connection = %connection_id, "No store sync channel to destroy");
            return;
        };

        let replicas: Vec<String> = self
            .stores
            .read()
            .await
            .values()
            .filter(|s| s.connection_id() == Some(connection_id))
            .map(|s| s.name().to_string())
            .collect();
        for name in replicas {
            self.destroy_store(&name).await;
        }

        self.channels.destroy_channel(&config.channel).await;
        info!(channel = %config.channel, "Store sync channel destroyed");
    }

    /// Open a replica of a remote store.
    ///
    /// The replica becomes ready once the authoritative store sends its
    /// content. Opening a replica that is already open on the same connection
    /// returns it.
    pub async fn open_galactic_store(&self, name: &str, connection_id: Uuid) -> Result<Arc<BusStore>> {
        self.open_galactic(name, connection_id, None).await
    }

    /// Like [`StoreManager::open_galactic_store`], rejecting writes whose
    /// values do not deserialize as `T`.
    pub async fn open_galactic_store_with_item_type<T: DeserializeOwned + 'static>(
        &self,
        name: &str,
        connection_id: Uuid,
    ) -> Result<Arc<BusStore>> {
        self.open_galactic(name, connection_id, Some(validator_for::<T>()))
            .await
    }

    async fn open_galactic(
        &self,
        name: &str,
        connection_id: Uuid,
        validator: Option<ItemValidator>,
    ) -> Result<Arc<BusStore>> {
        let link = {
            let configs = self.sync_channels.read().await;
            let config = configs
                .get(&connection_id)
                .ok_or(StoreError::SyncChannelNotConfigured(connection_id))?;
            GalacticLink {
                connection: Arc::clone(&config.connection),
                publish_destination: format!("{}{}", config.pub_prefix, config.channel),
                sync_channel: config.channel.clone(),
            }
        };

        let store = {
            let mut stores = self.stores.write().await;
            if let Some(existing) = stores.get(name) {
                if existing.connection_id() == Some(connection_id) {
                    return Ok(Arc::clone(existing));
                }
                return Err(StoreError::StoreAlreadyExists(name.to_string()));
            }
            let store = Arc::new(BusStore::galactic(name, link, validator, self.monitor.clone()));
            stores.insert(name.to_string(), Arc::clone(&store));
            store
        };

        if let Err(e) = store.open_upstream().await {
            self.stores.write().await.remove(name);
            return Err(e);
        }
        info!(store = %name, connection = %connection_id, "Galactic store opened");
        self.monitor.emit(MonitorEvent::StoreCreated {
            store: name.to_string(),
        });
        Ok(store)
    }

    /// Close a galactic replica and tell the authoritative store.
    pub async fn close_galactic_store(&self, name: &str) -> Result<()> {
        let store = self.get_store(name).await?;
        if !store.is_galactic() {
            return Err(StoreError::NotGalactic(name.to_string()));
        }
        self.destroy_store(name).await;
        Ok(())
    }

    async fn route_sync_message(&self, message: &Message) {
        let response: SyncResponse = match message.payload_as() {
            Ok(response) => response,
            Err(e) => {
                warn!(channel = %message.channel(), error = %e, "Malformed store sync message ignored");
                return;
            }
        };

        let store = self.stores.read().await.get(&response.store_id).cloned();
        match store {
            Some(store) if store.sync_channel() == Some(message.channel()) => {
                store.apply_sync_response(response).await;
            }
            _ => {
                debug!(
                    channel = %message.channel(),
                    store = %response.store_id,
                    "Sync message for unknown replica ignored"
                );
            }
        }
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("sync_channel_prefix", &self.sync_channel_prefix)
            .finish()
    }
}
