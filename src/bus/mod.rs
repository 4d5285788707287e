//! In-process event bus.
//!
//! This module contains:
//! - `EventBus`: the context object that owns one channel registry, one store
//!   registry and the monitor stream
//! - `Channel`/`ChannelManager`: named topics and their local/galactic state
//! - `MessageHandler`: per-subscription consumer
//! - Request/response helpers layered over channels

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

pub mod channel;
pub mod handler;
pub mod manager;
pub mod message;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod monitor;

// Re-exports
pub use channel::{handler_fn, Channel, EventHandler, HandlerFn, MessageFilter};
pub use handler::MessageHandler;
pub use manager::{BridgeSignal, ChannelManager};
pub use message::{Direction, Message};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockBrokerConnection;
pub use monitor::{BusMonitor, MonitorEvent};

use crate::config::{BusConfig, StoreSyncConfig};
use crate::interfaces::{BrokerConnection, BrokerError};
use crate::store::StoreManager;
use crate::transaction::{BusTransaction, TransactionType};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Channel '{0}' does not exist")]
    ChannelNotFound(String),

    #[error("Handler {0} is already handling messages")]
    HandlerAlreadyActive(Uuid),

    #[error("Handler has no request attached")]
    NoRequestAttached,

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bus context object.
///
/// Construct one per process at the composition root and share it by `Arc`.
pub struct EventBus {
    id: Uuid,
    monitor: BusMonitor,
    channels: Arc<ChannelManager>,
    stores: Arc<StoreManager>,
}

impl EventBus {
    /// Create a new bus.
    pub fn new(config: &BusConfig) -> Self {
        let monitor = BusMonitor::new(config.monitor_capacity);
        let channels = Arc::new(ChannelManager::new(
            monitor.clone(),
            config.bridge_signal_capacity,
        ));
        let stores = Arc::new(StoreManager::new(
            Arc::clone(&channels),
            monitor.clone(),
            config.sync_channel_prefix.clone(),
        ));
        let id = Uuid::new_v4();

        info!(bus = %id, "Event bus initialized");

        Self {
            id,
            monitor,
            channels,
            stores,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn store_manager(&self) -> &Arc<StoreManager> {
        &self.stores
    }

    pub fn monitor(&self) -> &BusMonitor {
        &self.monitor
    }

    /// Open this bus's store sync channel over `connection`, using the
    /// destination prefixes from the store sync configuration.
    pub async fn connect_store_sync(
        &self,
        connection: Arc<dyn BrokerConnection>,
        config: &StoreSyncConfig,
    ) -> crate::store::Result<String> {
        self.stores
            .configure_store_sync_channel(connection, &config.topic_prefix, &config.pub_prefix)
            .await
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send a request to a channel, optionally addressed to one destination.
    pub async fn send_request_message(
        &self,
        channel: &str,
        payload: impl Serialize,
        destination: Option<Uuid>,
    ) -> Result<()> {
        let message = Message::request(channel, serde_json::to_value(payload)?, destination);
        self.dispatch(message).await
    }

    /// Send a response to a channel, optionally addressed to one destination.
    pub async fn send_response_message(
        &self,
        channel: &str,
        payload: impl Serialize,
        destination: Option<Uuid>,
    ) -> Result<()> {
        let message = Message::response(channel, serde_json::to_value(payload)?, destination);
        self.dispatch(message).await
    }

    /// Send an error to a channel, optionally addressed to one destination.
    pub async fn send_error_message(
        &self,
        channel: &str,
        payload: impl Serialize,
        destination: Option<Uuid>,
    ) -> Result<()> {
        let message = Message::error(channel, serde_json::to_value(payload)?, destination);
        self.dispatch(message).await
    }

    async fn dispatch(&self, message: Message) -> Result<()> {
        let channel = message.channel().to_string();
        let handlers = self.channels.send(message).await?;
        debug!(channel = %channel, handlers, "Message sent");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Listening
    // ------------------------------------------------------------------------

    /// Listen for responses (and errors) on a channel.
    pub async fn listen_stream(&self, channel: &str) -> Result<MessageHandler> {
        self.listener(channel, None, false, &[Direction::Response, Direction::Error])
            .await
    }

    /// Listen for responses addressed to `destination`.
    pub async fn listen_stream_for_destination(
        &self,
        channel: &str,
        destination: Uuid,
    ) -> Result<MessageHandler> {
        self.listener(channel, Some(destination), false, &[Direction::Response, Direction::Error])
            .await
    }

    /// Listen for requests on a channel.
    pub async fn listen_request_stream(&self, channel: &str) -> Result<MessageHandler> {
        self.listener(channel, None, false, &[Direction::Request]).await
    }

    /// Listen for requests addressed to `destination`.
    pub async fn listen_request_stream_for_destination(
        &self,
        channel: &str,
        destination: Uuid,
    ) -> Result<MessageHandler> {
        self.listener(channel, Some(destination), false, &[Direction::Request])
            .await
    }

    /// Listen for every message on a channel regardless of direction.
    pub async fn listen_firehose(&self, channel: &str) -> Result<MessageHandler> {
        self.listener(
            channel,
            None,
            false,
            &[Direction::Request, Direction::Response, Direction::Error],
        )
        .await
    }

    /// Receive the next response (or error) on a channel, then stop.
    pub async fn listen_once(&self, channel: &str) -> Result<MessageHandler> {
        self.listener(channel, None, true, &[Direction::Response, Direction::Error])
            .await
    }

    /// Receive the next request on a channel, then stop.
    pub async fn listen_request_once(&self, channel: &str) -> Result<MessageHandler> {
        self.listener(channel, None, true, &[Direction::Request]).await
    }

    async fn listener(
        &self,
        channel: &str,
        destination: Option<Uuid>,
        run_once: bool,
        directions: &[Direction],
    ) -> Result<MessageHandler> {
        self.channels.get_channel(channel).await?;
        let mut filter = MessageFilter::directions(directions);
        if let Some(destination) = destination {
            filter = filter.with_correlation(destination);
        }
        Ok(MessageHandler::new(
            Arc::clone(&self.channels),
            channel,
            destination.unwrap_or_else(Uuid::new_v4),
            run_once,
            filter,
            None,
        ))
    }

    // ------------------------------------------------------------------------
    // Requesting
    // ------------------------------------------------------------------------

    /// Prepare a request whose single reply is delivered to the handler.
    ///
    /// Call `handle` then `fire` on the returned handler.
    pub async fn request_once(&self, channel: &str, payload: impl Serialize) -> Result<MessageHandler> {
        self.requester(channel, serde_json::to_value(payload)?, Uuid::new_v4(), true)
            .await
    }

    /// Like [`EventBus::request_once`], with a caller-chosen correlation id.
    pub async fn request_once_for_destination(
        &self,
        channel: &str,
        payload: impl Serialize,
        destination: Uuid,
    ) -> Result<MessageHandler> {
        self.requester(channel, serde_json::to_value(payload)?, destination, true)
            .await
    }

    /// Prepare a request whose replies keep arriving until the handler is closed.
    pub async fn request_stream(&self, channel: &str, payload: impl Serialize) -> Result<MessageHandler> {
        self.requester(channel, serde_json::to_value(payload)?, Uuid::new_v4(), false)
            .await
    }

    async fn requester(
        &self,
        channel: &str,
        payload: Value,
        correlation_id: Uuid,
        run_once: bool,
    ) -> Result<MessageHandler> {
        self.channels.get_channel(channel).await?;
        let filter = MessageFilter::directions(&[Direction::Response, Direction::Error])
            .with_correlation(correlation_id);
        let request = Message::request(channel, payload, Some(correlation_id));
        Ok(MessageHandler::new(
            Arc::clone(&self.channels),
            channel,
            correlation_id,
            run_once,
            filter,
            Some(request),
        ))
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Transaction whose requests run one after another in registration order.
    pub fn create_sync_transaction(&self) -> BusTransaction {
        BusTransaction::new(
            TransactionType::Sync,
            Arc::clone(&self.channels),
            Arc::clone(&self.stores),
        )
    }

    /// Transaction whose requests all run as soon as it is committed.
    pub fn create_async_transaction(&self) -> BusTransaction {
        BusTransaction::new(
            TransactionType::Async,
            Arc::clone(&self.channels),
            Arc::clone(&self.stores),
        )
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}
