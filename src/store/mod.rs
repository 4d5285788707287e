//! Versioned stores layered over the bus.
//!
//! This module contains:
//! - `BusStore`: versioned item map with change and mutation streams
//! - `StoreManager`: registry of local stores and galactic replicas
//! - `sync`: wire messages exchanged between replicas and the owning store

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

mod bus_store;
mod manager;
mod stream;
pub mod sync;

// Re-exports
pub use bus_store::{BusStore, INITIAL_VERSION};
pub use manager::StoreManager;
pub use stream::{
    ChangeFilter, MutationFilter, MutationRequest, MutationStream, NotificationStream,
    StoreStream, StreamFilter,
};

use crate::bus::BusError;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store '{0}' does not exist")]
    StoreNotFound(String),

    #[error("Store '{0}' already exists")]
    StoreAlreadyExists(String),

    #[error("Store '{0}' is already populated")]
    AlreadyPopulated(String),

    #[error("Operation not supported on galactic store '{0}'")]
    GalacticStore(String),

    #[error("Store '{0}' is not galactic")]
    NotGalactic(String),

    #[error("Stream is already subscribed")]
    AlreadySubscribed,

    #[error("Stream is not subscribed")]
    NotSubscribed,

    #[error("No store sync channel configured for connection {0}")]
    SyncChannelNotConfigured(Uuid),

    #[error("Invalid value for item '{item}' in store '{store}': {message}")]
    InvalidItem {
        store: String,
        item: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// One committed mutation of a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub id: String,
    /// New value, or the removed value for deletions.
    pub value: Value,
    pub state: Option<String>,
    pub is_delete: bool,
    pub store_version: i64,
}

impl StoreChange {
    pub fn value_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.value)
    }
}
