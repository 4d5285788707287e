//! Bus monitor stream.
//!
//! Lifecycle events for channels and stores are broadcast to any number of
//! observers. Hosting layers also publish into the monitor, e.g. when a remote
//! peer subscribes to a store sync channel. Emitting never blocks; observers
//! that lag lose the oldest events.

use tokio::sync::broadcast;
use tracing::trace;

/// Lifecycle event emitted on the monitor stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ChannelCreated { channel: String },
    ChannelDestroyed { channel: String },
    SubscriberJoined { channel: String },
    SubscriberLeft { channel: String },
    StoreCreated { store: String },
    StoreDestroyed { store: String },
    StoreInitialized { store: String },
    /// A remote peer subscribed to a channel through a hosting endpoint.
    FabricEndpointSubscribed { channel: String },
}

/// Broadcast hub for [`MonitorEvent`]s.
#[derive(Debug, Clone)]
pub struct BusMonitor {
    sender: broadcast::Sender<MonitorEvent>,
}

impl BusMonitor {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event. Events emitted with no observers are discarded.
    pub fn emit(&self, event: MonitorEvent) {
        match self.sender.send(event) {
            Ok(receivers) => trace!(receivers, "Monitor event emitted"),
            Err(broadcast::error::SendError(event)) => {
                trace!(?event, "Monitor event emitted (no observers)")
            }
        }
    }

    /// Observe events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

impl Default for BusMonitor {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MONITOR_CAPACITY)
    }
}
