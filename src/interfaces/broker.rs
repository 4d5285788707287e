//! Broker connection interface for galactic bridging.
//!
//! The bus never moves bytes between processes itself. A hosting layer
//! (STOMP over WebSocket, TCP, ...) supplies a `BrokerConnection`; the bus
//! subscribes to destinations through it and publishes store-sync requests
//! upstream with it.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to a remote broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Subscribe to '{destination}' failed: {message}")]
    Subscribe { destination: String, message: String },

    #[error("Send to '{destination}' failed: {message}")]
    Send { destination: String, message: String },

    #[error("Unsubscribe from '{destination}' failed: {message}")]
    Unsubscribe { destination: String, message: String },

    #[error("Connection is disconnected")]
    Disconnected,

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// An active subscription to one broker destination.
///
/// Inbound frames are raw payload bytes. The bus decodes them as JSON and
/// falls back to a string payload when a frame is not valid JSON.
#[async_trait]
pub trait BrokerSubscription: Send + Sync {
    /// Unique id of this subscription.
    fn id(&self) -> Uuid;

    /// Destination this subscription listens to.
    fn destination(&self) -> &str;

    /// Take the inbound frame stream.
    ///
    /// Returns `None` once the stream has already been taken.
    fn take_messages(&mut self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Stop receiving frames. The inbound stream closes afterwards.
    async fn unsubscribe(&self) -> Result<()>;
}

/// Connection to a remote message broker.
///
/// Implementations:
/// - `MockBrokerConnection`: in-memory connection for tests
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Unique id of this connection. Used to derive per-connection sync channel names.
    fn id(&self) -> Uuid;

    /// Subscribe to a destination on the broker.
    async fn subscribe(&self, destination: &str) -> Result<Box<dyn BrokerSubscription>>;

    /// Send a raw payload to a destination.
    async fn send_message(&self, destination: &str, payload: Vec<u8>) -> Result<()>;

    /// Send a JSON payload to a destination.
    async fn send_json_message(&self, destination: &str, payload: &serde_json::Value) -> Result<()> {
        let bytes =
            serde_json::to_vec(payload).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.send_message(destination, bytes).await
    }

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}
