//! Mock broker connection for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::interfaces::broker::{BrokerConnection, BrokerError, BrokerSubscription, Result};

/// Capacity of each mock subscription's inbound frame queue.
const FRAME_CAPACITY: usize = 256;

#[derive(Default)]
struct MockState {
    subscribers: RwLock<HashMap<String, Vec<(Uuid, mpsc::Sender<Vec<u8>>)>>>,
    sent: RwLock<Vec<(String, Vec<u8>)>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    fail_on_subscribe: AtomicBool,
    fail_on_send: AtomicBool,
    disconnected: AtomicBool,
}

/// In-memory broker connection.
///
/// Records outbound messages and lets tests inject inbound frames for any
/// destination that currently has a subscription.
#[derive(Clone)]
pub struct MockBrokerConnection {
    id: Uuid,
    state: Arc<MockState>,
}

impl MockBrokerConnection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(MockState::default()),
        }
    }

    pub fn subscribe_count(&self) -> usize {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_on_subscribe(&self, fail: bool) {
        self.state.fail_on_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.state.fail_on_send.store(fail, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions for a destination.
    pub async fn active_subscriptions(&self, destination: &str) -> usize {
        self.state
            .subscribers
            .read()
            .await
            .get(destination)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Push a raw frame to every subscription on `destination`.
    ///
    /// Returns the number of subscriptions that received it.
    pub async fn deliver_raw(&self, destination: &str, frame: Vec<u8>) -> usize {
        let targets: Vec<_> = self
            .state
            .subscribers
            .read()
            .await
            .get(destination)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for tx in targets {
            if tx.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push a JSON frame to every subscription on `destination`.
    pub async fn deliver(&self, destination: &str, payload: &serde_json::Value) -> usize {
        let frame = serde_json::to_vec(payload).unwrap_or_default();
        self.deliver_raw(destination, frame).await
    }

    /// Messages sent through this connection, decoded as JSON where possible.
    pub async fn sent_messages(&self) -> Vec<(String, serde_json::Value)> {
        self.state
            .sent
            .read()
            .await
            .iter()
            .map(|(dest, bytes)| {
                let value = serde_json::from_slice(bytes).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
                });
                (dest.clone(), value)
            })
            .collect()
    }

    pub async fn sent_count(&self) -> usize {
        self.state.sent.read().await.len()
    }
}

impl Default for MockBrokerConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnection for MockBrokerConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn subscribe(&self, destination: &str) -> Result<Box<dyn BrokerSubscription>> {
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_on_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscribe {
                destination: destination.to_string(),
                message: "Mock subscribe failure".to_string(),
            });
        }
        if self.is_disconnected() {
            return Err(BrokerError::Disconnected);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(FRAME_CAPACITY);
        self.state
            .subscribers
            .write()
            .await
            .entry(destination.to_string())
            .or_default()
            .push((id, tx));

        Ok(Box::new(MockSubscription {
            id,
            destination: destination.to_string(),
            frames: Some(rx),
            state: Arc::clone(&self.state),
        }))
    }

    async fn send_message(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        if self.state.fail_on_send.load(Ordering::SeqCst) {
            return Err(BrokerError::Send {
                destination: destination.to_string(),
                message: "Mock send failure".to_string(),
            });
        }
        if self.is_disconnected() {
            return Err(BrokerError::Disconnected);
        }
        self.state
            .sent
            .write()
            .await
            .push((destination.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        self.state.subscribers.write().await.clear();
        Ok(())
    }
}

/// Subscription handed out by [`MockBrokerConnection`].
pub struct MockSubscription {
    id: Uuid,
    destination: String,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    state: Arc<MockState>,
}

#[async_trait]
impl BrokerSubscription for MockSubscription {
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
        self.state.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.state.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(&self.destination) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                subscribers.remove(&self.destination);
            }
        }
        Ok(())
    }
}
