//! Bus and store-sync configuration types.

use serde::Deserialize;

/// Default broadcast capacity of the monitor stream.
pub const DEFAULT_MONITOR_CAPACITY: usize = 1024;

/// Default number of bridge signals that may wait for a reader.
pub const DEFAULT_BRIDGE_SIGNAL_CAPACITY: usize = 1;

/// Prefix of per-connection store sync channels.
pub const DEFAULT_SYNC_CHANNEL_PREFIX: &str = "fabric-store-sync.";

/// Broker destination prefix for topics the client subscribes to.
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic/";

/// Broker destination prefix for messages the client publishes.
pub const DEFAULT_PUB_PREFIX: &str = "/pub/";

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of the monitor broadcast stream.
    pub monitor_capacity: usize,
    /// Slots in the bridge mapped/unmapped signal. Signals beyond this are dropped.
    pub bridge_signal_capacity: usize,
    /// Prefix of per-connection store sync channel names.
    pub sync_channel_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            monitor_capacity: DEFAULT_MONITOR_CAPACITY,
            bridge_signal_capacity: DEFAULT_BRIDGE_SIGNAL_CAPACITY,
            sync_channel_prefix: DEFAULT_SYNC_CHANNEL_PREFIX.to_string(),
        }
    }
}

/// Store synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSyncConfig {
    /// Destination prefix for subscriptions (client side).
    pub topic_prefix: String,
    /// Destination prefix for publishing (client side).
    pub pub_prefix: String,
}

impl Default for StoreSyncConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            pub_prefix: DEFAULT_PUB_PREFIX.to_string(),
        }
    }
}

/// A store seeded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeedStoreConfig {
    /// Store name.
    pub name: String,
    /// Initial items.
    pub items: std::collections::HashMap<String, serde_json::Value>,
}
