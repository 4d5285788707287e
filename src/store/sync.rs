//! Store synchronization wire messages.
//!
//! Galactic store replicas talk to the authoritative store over a
//! per-connection sync channel. Clients publish [`SyncRequest`]s upstream;
//! the server answers on the sync channel with [`SyncResponse`]s. Field names
//! are camelCase on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const OPEN_STORE_REQUEST: &str = "openStore";
pub const UPDATE_STORE_REQUEST: &str = "updateStore";
pub const CLOSE_STORE_REQUEST: &str = "closeStore";

/// Client to server request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: Uuid,
    pub request: String,
    #[serde(default)]
    pub payload: SyncRequestPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Absent or null on an update means "remove the item".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_item_value: Option<Value>,
}

impl SyncRequest {
    fn new(request: &str, payload: SyncRequestPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.to_string(),
            payload,
        }
    }

    pub fn open_store(store_id: &str) -> Self {
        Self::new(
            OPEN_STORE_REQUEST,
            SyncRequestPayload {
                store_id: Some(store_id.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn close_store(store_id: &str) -> Self {
        Self::new(
            CLOSE_STORE_REQUEST,
            SyncRequestPayload {
                store_id: Some(store_id.to_string()),
                ..Default::default()
            },
        )
    }

    /// Request an item write, or a removal when `new_item_value` is `None`.
    pub fn update_store(store_id: &str, item_id: &str, new_item_value: Option<Value>) -> Self {
        Self::new(
            UPDATE_STORE_REQUEST,
            SyncRequestPayload {
                store_id: Some(store_id.to_string()),
                item_id: Some(item_id.to_string()),
                new_item_value,
            },
        )
    }
}

/// Kind of a server to client sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncResponseType {
    StoreContentResponse,
    UpdateStoreResponse,
    Error,
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub id: Uuid,
    pub response_type: SyncResponseType,
    #[serde(default)]
    pub store_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Null for deletions; always present on the wire.
    #[serde(default)]
    pub new_item_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncResponse {
    pub fn store_content(
        request_id: Uuid,
        store_id: &str,
        items: HashMap<String, Value>,
        store_version: i64,
    ) -> Self {
        Self {
            id: request_id,
            response_type: SyncResponseType::StoreContentResponse,
            store_id: store_id.to_string(),
            items: Some(items),
            store_version: Some(store_version),
            item_id: None,
            new_item_value: Value::Null,
            error_message: None,
        }
    }

    /// Broadcast of one committed change. `new_item_value` is null when the
    /// item was deleted.
    pub fn update_store(
        store_id: &str,
        item_id: &str,
        new_item_value: Value,
        store_version: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            response_type: SyncResponseType::UpdateStoreResponse,
            store_id: store_id.to_string(),
            items: None,
            store_version: Some(store_version),
            item_id: Some(item_id.to_string()),
            new_item_value,
            error_message: None,
        }
    }

    pub fn error(request_id: Uuid, store_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            id: request_id,
            response_type: SyncResponseType::Error,
            store_id: store_id.unwrap_or_default().to_string(),
            items: None,
            store_version: None,
            item_id: None,
            new_item_value: Value::Null,
            error_message: Some(message.into()),
        }
    }
}
