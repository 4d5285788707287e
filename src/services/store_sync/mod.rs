//! Store synchronization service.
//!
//! Keeps galactic replicas consistent with the authoritative stores of this
//! bus. Every remote connection talks to the service over its own sync
//! channel. Requests arrive as request messages on that channel and replies
//! leave as response (or error) messages on it.
//!
//! ## Replica protocol
//!
//! - `openStore` registers the client channel with the store's listener and
//!   answers with the store content once the store is ready
//! - `updateStore` writes or removes one item on the authoritative store
//! - `closeStore` unregisters the client channel
//!
//! One listener exists per store that has at least one client. It turns each
//! committed change into an `updateStoreResponse` and sends it to every
//! registered client channel.
//!
//! Client channels are discovered through the bus monitor: a remote peer
//! subscribing to a sync channel opens a client, destroying the channel
//! closes it along with every store it had open.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{
    handler_fn, BusError, ChannelManager, Direction, EventBus, Message, MessageFilter,
    MonitorEvent,
};
use crate::store::sync::{
    SyncRequest, SyncResponse, CLOSE_STORE_REQUEST, OPEN_STORE_REQUEST, UPDATE_STORE_REQUEST,
};
use crate::store::{BusStore, StoreChange, StoreStream};

/// One remote connection's sync channel.
struct SyncClient {
    handler_id: Uuid,
    open_stores: HashSet<String>,
}

/// Change feed of one store, shared by all clients that opened it.
struct StoreListener {
    stream: StoreStream,
    clients: Arc<RwLock<BTreeSet<String>>>,
}

#[derive(Default)]
struct ServiceState {
    clients: HashMap<String, SyncClient>,
    listeners: HashMap<String, StoreListener>,
}

/// Serves store sync channels.
pub struct StoreSyncService {
    bus: Arc<EventBus>,
    state: Mutex<ServiceState>,
}

impl StoreSyncService {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Mutex::new(ServiceState::default()),
        })
    }

    /// Follow the bus monitor, opening and closing clients as sync channels
    /// come and go. Runs until the monitor closes.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.bus.monitor().subscribe();
        let service = Arc::downgrade(self);
        info!(
            prefix = %self.bus.store_manager().sync_channel_prefix(),
            "Store sync service started"
        );

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store sync service lagged behind monitor");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.on_monitor_event(event).await;
            }
            debug!("Store sync service stopped");
        })
    }

    async fn on_monitor_event(self: &Arc<Self>, event: MonitorEvent) {
        let prefix = self.bus.store_manager().sync_channel_prefix();
        match event {
            MonitorEvent::FabricEndpointSubscribed { channel } if channel.starts_with(prefix) => {
                if let Err(e) = self.open_client(&channel).await {
                    error!(channel = %channel, error = %e, "Failed to open store sync client");
                }
            }
            MonitorEvent::ChannelDestroyed { channel } if channel.starts_with(prefix) => {
                self.close_client(&channel).await;
            }
            _ => {}
        }
    }

    /// Start serving requests on a sync channel, creating it if needed.
    pub async fn open_client(self: &Arc<Self>, channel: &str) -> crate::bus::Result<()> {
        let mut state = self.state.lock().await;
        if state.clients.contains_key(channel) {
            return Ok(());
        }

        // Requests are handled on the channel's worker for this handler, one
        // at a time in arrival order.
        let channels = self.bus.channel_manager();
        channels.create_channel(channel).await;
        let service: Weak<Self> = Arc::downgrade(self);
        let name = channel.to_string();
        let callback = handler_fn(move |request: Arc<Message>| {
            let service = service.clone();
            let channel = name.clone();
            async move {
                if let Some(service) = service.upgrade() {
                    service.handle_request(&channel, &request).await;
                }
            }
        });
        let handler_id = channels
            .subscribe_handler(
                channel,
                MessageFilter::directions(&[Direction::Request]),
                callback,
                false,
            )
            .await?;

        state.clients.insert(
            channel.to_string(),
            SyncClient {
                handler_id,
                open_stores: HashSet::new(),
            },
        );
        info!(channel = %channel, "Store sync client opened");
        Ok(())
    }

    /// Stop serving a sync channel and close every store it had open.
    pub async fn close_client(&self, channel: &str) {
        let mut state = self.state.lock().await;
        let Some(client) = state.clients.remove(channel) else {
            return;
        };
        match self
            .bus
            .channel_manager()
            .unsubscribe_handler(channel, client.handler_id)
            .await
        {
            Ok(()) | Err(BusError::ChannelNotFound(_)) => {}
            Err(e) => debug!(channel = %channel, error = %e, "Sync channel handler close failed"),
        }
        for store in &client.open_stores {
            Self::unregister(&mut state, store, channel).await;
        }
        info!(channel = %channel, stores = client.open_stores.len(), "Store sync client closed");
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Number of client channels replicating `store`, `None` when the store
    /// has no listener.
    pub async fn listener_clients(&self, store: &str) -> Option<usize> {
        let state = self.state.lock().await;
        let listener = state.listeners.get(store)?;
        let clients = listener.clients.read().await.len();
        Some(clients)
    }

    async fn handle_request(self: &Arc<Self>, channel: &str, message: &Message) {
        let request: SyncRequest = match message.payload_as() {
            Ok(request) => request,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Malformed store sync request");
                let id = message.correlation_id().unwrap_or_else(|| message.id());
                self.reply_error(channel, id, None, "Invalid store sync request").await;
                return;
            }
        };

        debug!(channel = %channel, request = %request.request, "Store sync request");
        match request.request.as_str() {
            OPEN_STORE_REQUEST => self.open_store(channel, &request).await,
            UPDATE_STORE_REQUEST => self.update_store(channel, request).await,
            CLOSE_STORE_REQUEST => self.close_store(channel, &request).await,
            other => {
                let text = format!("Unknown store sync request: {other}");
                self.reply_error(channel, request.id, request.payload.store_id.as_deref(), text)
                    .await;
            }
        }
    }

    async fn open_store(self: &Arc<Self>, channel: &str, request: &SyncRequest) {
        let Some(store_id) = request.payload.store_id.as_deref() else {
            self.reply_error(channel, request.id, None, "Invalid OpenStoreRequest")
                .await;
            return;
        };
        let Ok(store) = self.bus.store_manager().get_store(store_id).await else {
            let text = format!("Cannot open non-existing store: {store_id}");
            self.reply_error(channel, request.id, Some(store_id), text).await;
            return;
        };

        {
            let mut state = self.state.lock().await;
            let Some(client) = state.clients.get_mut(channel) else {
                debug!(channel = %channel, "Open store on closed client ignored");
                return;
            };
            client.open_stores.insert(store_id.to_string());
            self.register(&mut state, &store, channel).await;
        }

        // Updates committed from here on reach the client through the
        // listener; the client drops those older than the content version.
        if store.is_ready() {
            self.send_content(channel, request.id, &store).await;
            return;
        }

        // Waiting must not hold up the requests queued behind this one.
        let service = Arc::clone(self);
        let channel = channel.to_string();
        let request_id = request.id;
        tokio::spawn(async move {
            store.ready().await;
            service.send_content(&channel, request_id, &store).await;
        });
    }

    async fn send_content(&self, channel: &str, request_id: Uuid, store: &BusStore) {
        let (items, version) = store.all_values_and_version().await;
        let response = SyncResponse::store_content(request_id, store.name(), items, version);
        if let Err(e) = self
            .bus
            .send_response_message(channel, response, Some(request_id))
            .await
        {
            warn!(channel = %channel, store = %store.name(), error = %e, "Store content reply failed");
            return;
        }
        info!(channel = %channel, store = %store.name(), version, "Store opened by client");
    }

    async fn update_store(&self, channel: &str, request: SyncRequest) {
        let Some(store_id) = request.payload.store_id.as_deref() else {
            self.reply_error(channel, request.id, None, "Invalid UpdateStoreRequest: null StoreId")
                .await;
            return;
        };
        let Some(item_id) = request.payload.item_id.as_deref() else {
            self.reply_error(
                channel,
                request.id,
                Some(store_id),
                "Invalid UpdateStoreRequest: null ItemId",
            )
            .await;
            return;
        };
        let Ok(store) = self.bus.store_manager().get_store(store_id).await else {
            let text = format!("Cannot update non-existing store: {store_id}");
            self.reply_error(channel, request.id, Some(store_id), text).await;
            return;
        };

        let result = match request.payload.new_item_value.clone() {
            None | Some(Value::Null) => store.remove(item_id, None).await.map(|_| ()),
            Some(value) => store.put(item_id, value, None).await,
        };
        if let Err(e) = result {
            warn!(channel = %channel, store = %store_id, item = %item_id, error = %e, "Store update rejected");
            self.reply_error(channel, request.id, Some(store_id), e.to_string())
                .await;
        }
    }

    async fn close_store(&self, channel: &str, request: &SyncRequest) {
        let Some(store_id) = request.payload.store_id.as_deref() else {
            self.reply_error(channel, request.id, None, "Invalid CloseStoreRequest")
                .await;
            return;
        };

        let mut state = self.state.lock().await;
        let Some(client) = state.clients.get_mut(channel) else {
            return;
        };
        if client.open_stores.remove(store_id) {
            Self::unregister(&mut state, store_id, channel).await;
            info!(channel = %channel, store = %store_id, "Store closed by client");
        }
    }

    /// Add a client channel to the store's listener, creating the listener
    /// on first use.
    async fn register(&self, state: &mut ServiceState, store: &Arc<BusStore>, channel: &str) {
        if let Some(listener) = state.listeners.get(store.name()) {
            listener.clients.write().await.insert(channel.to_string());
            return;
        }

        let clients = Arc::new(RwLock::new(BTreeSet::from([channel.to_string()])));
        let stream = store.on_all_changes(&[]);
        let channels = Arc::clone(self.bus.channel_manager());
        let targets = Arc::clone(&clients);
        let store_id = store.name().to_string();
        let subscribed = stream
            .subscribe(move |change: StoreChange| {
                let channels = Arc::clone(&channels);
                let targets = Arc::clone(&targets);
                let store_id = store_id.clone();
                async move { broadcast_change(&channels, &targets, &store_id, change).await }
            })
            .await;
        if let Err(e) = subscribed {
            error!(store = %store.name(), error = %e, "Store listener subscribe failed");
            return;
        }

        debug!(store = %store.name(), "Store listener created");
        state
            .listeners
            .insert(store.name().to_string(), StoreListener { stream, clients });
    }

    /// Remove a client channel from a store's listener, discarding the
    /// listener when no client is left.
    async fn unregister(state: &mut ServiceState, store: &str, channel: &str) {
        let Some(listener) = state.listeners.get(store) else {
            return;
        };
        let remaining = {
            let mut clients = listener.clients.write().await;
            clients.remove(channel);
            clients.len()
        };
        if remaining > 0 {
            return;
        }

        if let Some(listener) = state.listeners.remove(store) {
            if let Err(e) = listener.stream.unsubscribe().await {
                debug!(store = %store, error = %e, "Store listener already detached");
            }
            debug!(store = %store, "Store listener discarded");
        }
    }

    async fn reply_error(
        &self,
        channel: &str,
        request_id: Uuid,
        store_id: Option<&str>,
        text: impl Into<String>,
    ) {
        let response = SyncResponse::error(request_id, store_id, text);
        warn!(
            channel = %channel,
            error = response.error_message.as_deref().unwrap_or_default(),
            "Store sync request failed"
        );
        if let Err(e) = self
            .bus
            .send_error_message(channel, response, Some(request_id))
            .await
        {
            warn!(channel = %channel, error = %e, "Error reply failed");
        }
    }
}

/// Send one committed change to every client channel of a store.
async fn broadcast_change(
    channels: &ChannelManager,
    targets: &RwLock<BTreeSet<String>>,
    store_id: &str,
    change: StoreChange,
) {
    let value = if change.is_delete {
        Value::Null
    } else {
        change.value
    };
    let response = SyncResponse::update_store(store_id, &change.id, value, change.store_version);
    let payload = match serde_json::to_value(&response) {
        Ok(payload) => payload,
        Err(e) => {
            error!(store = %store_id, error = %e, "Update response serialization failed");
            return;
        }
    };

    let targets: Vec<String> = targets.read().await.iter().cloned().collect();
    for channel in targets {
        if let Err(e) = channels
            .send(Message::response(&channel, payload.clone(), None))
            .await
        {
            debug!(channel = %channel, error = %e, "Update broadcast skipped");
        }
    }
}
