//! Shared utilities for integration tests.
//!
//! Provides a loopback broker connection that links a replica bus to a
//! server bus in the same process, standing in for a hosting layer:
//! - subscribing to `<topic_prefix><channel>` creates the sync channel on the
//!   server bus, forwards its replies to the subscriber and announces the
//!   endpoint on the server monitor
//! - sending to `<pub_prefix><channel>` delivers the payload as a request on
//!   the server's channel

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use fabric_bus::bus::{EventBus, MessageHandler, MonitorEvent};
use fabric_bus::interfaces::broker::{BrokerConnection, BrokerError, BrokerSubscription, Result};

pub const TOPIC_PREFIX: &str = "/topic/";
pub const PUB_PREFIX: &str = "/pub/";

type Subscribers = RwLock<HashMap<Uuid, (String, mpsc::Sender<Vec<u8>>)>>;

/// Broker connection looped back into a server bus.
pub struct LoopbackConnection {
    id: Uuid,
    server: Arc<EventBus>,
    subscribers: Arc<Subscribers>,
    forwarders: RwLock<Vec<MessageHandler>>,
}

impl LoopbackConnection {
    pub fn new(server: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            server,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            forwarders: RwLock::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BrokerConnection for LoopbackConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn BrokerSubscription>> {
        let channel = destination
            .strip_prefix(TOPIC_PREFIX)
            .ok_or_else(|| BrokerError::Subscribe {
                destination: destination.to_string(),
                message: "unknown topic".to_string(),
            })?
            .to_string();

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .write()
            .await
            .insert(id, (destination.to_string(), tx.clone()));

        self.server.channel_manager().create_channel(&channel).await;
        let forwarder = self
            .server
            .listen_stream(&channel)
            .await
            .map_err(|e| BrokerError::Subscribe {
                destination: destination.to_string(),
                message: e.to_string(),
            })?;
        forwarder
            .handle(
                {
                    let tx = tx.clone();
                    move |msg| {
                        let _ = tx.try_send(serde_json::to_vec(msg.payload()).unwrap());
                    }
                },
                move |msg| {
                    let _ = tx.try_send(serde_json::to_vec(msg.payload()).unwrap());
                },
            )
            .await
            .map_err(|e| BrokerError::Subscribe {
                destination: destination.to_string(),
                message: e.to_string(),
            })?;
        self.forwarders.write().await.push(forwarder);

        self.server
            .monitor()
            .emit(MonitorEvent::FabricEndpointSubscribed { channel });

        Ok(Box::new(LoopbackSubscription {
            id,
            destination: destination.to_string(),
            frames: Some(rx),
            subscribers: Arc::clone(&self.subscribers),
        }))
    }

    async fn send_message(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        let channel = destination
            .strip_prefix(PUB_PREFIX)
            .ok_or_else(|| BrokerError::Send {
                destination: destination.to_string(),
                message: "unknown destination".to_string(),
            })?;
        let value: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.server
            .send_request_message(channel, value, None)
            .await
            .map_err(|e| BrokerError::Send {
                destination: destination.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<()> {
        self.subscribers.write().await.clear();
        Ok(())
    }
}

pub struct LoopbackSubscription {
    id: Uuid,
    destination: String,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    subscribers: Arc<Subscribers>,
}

#[async_trait]
impl BrokerSubscription for LoopbackSubscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn take_messages(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.frames.take()
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.subscribers.write().await.remove(&self.id);
        Ok(())
    }
}

/// Poll `check` until it holds, failing the test after one second.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}
