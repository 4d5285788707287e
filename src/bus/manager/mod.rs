//! Channel registry.
//!
//! Owns every channel of one bus, and moves channels between local and
//! galactic mode. A channel name maps to at most one `Channel` for the
//! lifetime of the manager.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{BrokerBinding, Channel, EventHandler, HandlerFn, MessageFilter};
use super::message::Message;
use super::monitor::{BusMonitor, MonitorEvent};
use super::{BusError, Result};
use crate::interfaces::BrokerConnection;

/// Best-effort notification that a galactic binding changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSignal {
    Mapped { channel: String, destination: String },
    Unmapped { channel: String, destination: String },
}

/// Registry of named channels.
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    monitor: BusMonitor,
    bridge_tx: mpsc::Sender<BridgeSignal>,
    bridge_rx: Mutex<Option<mpsc::Receiver<BridgeSignal>>>,
}

impl ChannelManager {
    /// Create a manager.
    ///
    /// `bridge_signal_capacity` is the number of bridge signals that can wait
    /// for a reader; signals beyond that are discarded.
    pub fn new(monitor: BusMonitor, bridge_signal_capacity: usize) -> Self {
        let (bridge_tx, bridge_rx) = mpsc::channel(bridge_signal_capacity.max(1));
        Self {
            channels: RwLock::new(HashMap::new()),
            monitor,
            bridge_tx,
            bridge_rx: Mutex::new(Some(bridge_rx)),
        }
    }

    /// Create a channel, or return the existing one with that name.
    pub async fn create_channel(&self, name: &str) -> Arc<Channel> {
        let (channel, created) = {
            let mut channels = self.channels.write().await;
            match channels.get(name) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let channel = Arc::new(Channel::new(name));
                    channels.insert(name.to_string(), Arc::clone(&channel));
                    (channel, true)
                }
            }
        };

        if created {
            info!(channel = %name, "Channel created");
            self.monitor.emit(MonitorEvent::ChannelCreated {
                channel: name.to_string(),
            });
        }
        channel
    }

    /// Destroy a channel. Destroying an unknown channel is a no-op.
    ///
    /// Any broker bindings are released first.
    pub async fn destroy_channel(&self, name: &str) {
        let removed = self.channels.write().await.remove(name);
        let Some(channel) = removed else {
            debug!(channel = %name, "Destroy of unknown channel ignored");
            return;
        };

        self.release_bindings(&channel).await;
        info!(channel = %name, "Channel destroyed");
        self.monitor.emit(MonitorEvent::ChannelDestroyed {
            channel: name.to_string(),
        });
    }

    pub async fn get_channel(&self, name: &str) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))
    }

    pub async fn check_channel_exists(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    /// Names of all registered channels, sorted.
    pub async fn list_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Attach a handler to a channel and return its id.
    pub async fn subscribe_handler(
        &self,
        name: &str,
        filter: MessageFilter,
        callback: HandlerFn,
        run_once: bool,
    ) -> Result<Uuid> {
        self.subscribe_handler_with_id(name, Uuid::new_v4(), filter, callback, run_once)
            .await
    }

    /// Attach a handler with a caller-chosen id.
    pub async fn subscribe_handler_with_id(
        &self,
        name: &str,
        id: Uuid,
        filter: MessageFilter,
        callback: HandlerFn,
        run_once: bool,
    ) -> Result<Uuid> {
        let channel = self.get_channel(name).await?;
        channel
            .subscribe(EventHandler::new(id, run_once, filter, callback))
            .await;

        debug!(channel = %name, handler = %id, run_once, "Handler subscribed");
        self.monitor.emit(MonitorEvent::SubscriberJoined {
            channel: name.to_string(),
        });
        Ok(id)
    }

    /// Detach a handler.
    ///
    /// Fails only when the channel does not exist; removing a handler that is
    /// already gone is a no-op.
    pub async fn unsubscribe_handler(&self, name: &str, id: Uuid) -> Result<()> {
        let channel = self.get_channel(name).await?;
        if channel.unsubscribe(id).await {
            debug!(channel = %name, handler = %id, "Handler unsubscribed");
            self.monitor.emit(MonitorEvent::SubscriberLeft {
                channel: name.to_string(),
            });
        } else {
            debug!(channel = %name, handler = %id, "Unsubscribe of unknown handler ignored");
        }
        Ok(())
    }

    /// Deliver a message to a channel's handlers.
    pub async fn send(&self, message: Message) -> Result<usize> {
        let channel = self.get_channel(message.channel()).await?;
        Ok(channel.send(message).await)
    }

    /// Resolve once all in-flight deliveries on a channel have finished.
    pub async fn wait_for_channel(&self, name: &str) -> Result<()> {
        let channel = self.get_channel(name).await?;
        channel.wait_for_delivery().await;
        Ok(())
    }

    /// Bind a channel to a broker destination.
    ///
    /// Inbound frames on the destination are delivered to the channel's
    /// handlers as response messages. Binding the same (connection,
    /// destination) pair again is a no-op, so racing callers cause one
    /// upstream subscribe.
    pub async fn mark_channel_as_galactic(
        &self,
        name: &str,
        destination: &str,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<()> {
        let channel = self.get_channel(name).await?;

        let mut bindings = channel.bindings.lock().await;
        if bindings
            .iter()
            .any(|b| b.connection.id() == connection.id() && b.destination == destination)
        {
            debug!(channel = %name, destination = %destination, "Channel already bound");
            return Ok(());
        }

        let mut subscription = connection.subscribe(destination).await?;
        let pump = subscription
            .take_messages()
            .map(|frames| spawn_broker_pump(Arc::clone(&channel), frames));

        bindings.push(BrokerBinding {
            connection,
            destination: destination.to_string(),
            subscription,
            pump,
        });
        channel.set_galactic(true);
        drop(bindings);

        info!(channel = %name, destination = %destination, "Channel marked galactic");
        self.signal(BridgeSignal::Mapped {
            channel: name.to_string(),
            destination: destination.to_string(),
        });
        Ok(())
    }

    /// Release every broker binding of a channel.
    ///
    /// A channel that was never galactic is left untouched.
    pub async fn mark_channel_as_local(&self, name: &str) -> Result<()> {
        let channel = self.get_channel(name).await?;
        self.release_bindings(&channel).await;
        Ok(())
    }

    /// Take the receiving end of the bridge signal slot.
    ///
    /// Only the first caller gets it.
    pub async fn take_bridge_signals(&self) -> Option<mpsc::Receiver<BridgeSignal>> {
        self.bridge_rx.lock().await.take()
    }

    async fn release_bindings(&self, channel: &Channel) {
        channel.set_galactic(false);
        let bindings: Vec<BrokerBinding> = std::mem::take(&mut *channel.bindings.lock().await);

        for binding in bindings {
            if let Err(e) = binding.subscription.unsubscribe().await {
                warn!(
                    channel = %channel.name(),
                    destination = %binding.destination,
                    error = %e,
                    "Broker unsubscribe failed"
                );
            }
            if let Some(pump) = binding.pump {
                pump.abort();
            }

            info!(channel = %channel.name(), destination = %binding.destination, "Channel binding released");
            self.signal(BridgeSignal::Unmapped {
                channel: channel.name().to_string(),
                destination: binding.destination,
            });
        }
    }

    fn signal(&self, signal: BridgeSignal) {
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.bridge_tx.try_send(signal) {
            debug!(signal = ?dropped, "Bridge signal dropped");
        }
    }
}

/// Forward inbound broker frames to a channel as response messages.
fn spawn_broker_pump(channel: Arc<Channel>, mut frames: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let payload = decode_frame(&frame);
            channel
                .send(Message::response(channel.name(), payload, None))
                .await;
        }
        debug!(channel = %channel.name(), "Broker frame stream closed");
    })
}

/// Decode a broker frame as JSON, falling back to a string payload.
pub(crate) fn decode_frame(frame: &[u8]) -> serde_json::Value {
    serde_json::from_slice(frame).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(frame).into_owned())
    })
}
