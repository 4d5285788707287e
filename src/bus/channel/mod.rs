//! Named bus channel.
//!
//! A channel owns an ordered list of handlers and an optional set of broker
//! bindings that make it galactic. Each handler is drained by its own tokio
//! task, so a slow handler delays only itself and sees messages in send
//! order. The channel's delivery barrier counts deliveries that have been
//! queued but not yet handled.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use super::message::{Direction, Message};
use crate::interfaces::{BrokerConnection, BrokerSubscription};

/// Callback invoked for every message a handler accepts.
pub type HandlerFn = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Decides which messages on a channel a handler receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Only messages correlated to this id. `None` accepts broadcast traffic.
    pub correlation_id: Option<Uuid>,
    /// Accepted directions. `None` accepts every direction.
    pub directions: Option<Vec<Direction>>,
}

impl MessageFilter {
    /// Accept everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Accept only the given directions.
    pub fn directions(directions: &[Direction]) -> Self {
        Self {
            correlation_id: None,
            directions: Some(directions.to_vec()),
        }
    }

    /// Restrict to messages correlated to `id`.
    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(directions) = &self.directions {
            if !directions.contains(&message.direction()) {
                return false;
            }
        }
        match self.correlation_id {
            None => true,
            Some(id) => message.correlation_id() == Some(id),
        }
    }
}

/// Subscription record held by a channel.
pub struct EventHandler {
    pub id: Uuid,
    pub run_once: bool,
    pub filter: MessageFilter,
    callback: HandlerFn,
}

impl EventHandler {
    pub fn new(id: Uuid, run_once: bool, filter: MessageFilter, callback: HandlerFn) -> Self {
        Self {
            id,
            run_once,
            filter,
            callback,
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("id", &self.id)
            .field("run_once", &self.run_once)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Counts deliveries that have been dispatched but not yet finished.
#[derive(Debug, Default)]
pub struct DeliveryBarrier {
    in_flight: AtomicUsize,
    drained: Notify,
}

impl DeliveryBarrier {
    fn enter(self: &Arc<Self>) -> DeliveryGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        DeliveryGuard {
            barrier: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no delivery is in flight.
    pub async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            drained.await;
        }
    }
}

struct DeliveryGuard {
    barrier: Arc<DeliveryBarrier>,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        if self.barrier.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.barrier.drained.notify_waiters();
        }
    }
}

/// A live binding between a channel and one broker destination.
pub(crate) struct BrokerBinding {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) destination: String,
    pub(crate) subscription: Box<dyn BrokerSubscription>,
    pub(crate) pump: Option<JoinHandle<()>>,
}

/// A message queued for one handler, holding its barrier slot until handled.
struct Delivery {
    message: Arc<Message>,
    _guard: DeliveryGuard,
}

/// A subscribed handler and the queue feeding its worker task.
struct HandlerSlot {
    handler: EventHandler,
    queue: mpsc::UnboundedSender<Delivery>,
}

/// Named pub/sub topic.
pub struct Channel {
    name: String,
    handlers: RwLock<Vec<HandlerSlot>>,
    galactic: AtomicBool,
    pub(crate) bindings: Mutex<Vec<BrokerBinding>>,
    barrier: Arc<DeliveryBarrier>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: RwLock::new(Vec::new()),
            galactic: AtomicBool::new(false),
            bindings: Mutex::new(Vec::new()),
            barrier: Arc::new(DeliveryBarrier::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_galactic(&self) -> bool {
        self.galactic.load(Ordering::SeqCst)
    }

    pub(crate) fn set_galactic(&self, galactic: bool) {
        self.galactic.store(galactic, Ordering::SeqCst);
    }

    /// Append a handler to the channel and start its worker task.
    pub async fn subscribe(&self, handler: EventHandler) {
        let (queue, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
        let callback = Arc::clone(&handler.callback);
        let channel = self.name.clone();
        let handler_id = handler.id;

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let outcome = AssertUnwindSafe(callback(Arc::clone(&delivery.message)))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!(channel = %channel, handler = %handler_id, "Handler panicked");
                }
            }
        });

        self.handlers.write().await.push(HandlerSlot { handler, queue });
    }

    /// Remove a handler. Returns `false` if no handler has that id.
    ///
    /// Messages already queued for the handler are still delivered.
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|slot| slot.handler.id != id);
        handlers.len() != before
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn contains_handler(&self, id: Uuid) -> bool {
        self.handlers.read().await.iter().any(|slot| slot.handler.id == id)
    }

    /// Queue a message for every matching handler.
    ///
    /// Run-once handlers are removed under the handler lock as they match, so
    /// they fire at most once even when messages race. Queueing happens under
    /// the same lock, which keeps every handler's view in send order. Returns
    /// the number of handlers the message was queued for.
    pub async fn send(&self, message: Message) -> usize {
        let message = Arc::new(message);
        let mut dispatched = 0;

        {
            let mut handlers = self.handlers.write().await;
            handlers.retain(|slot| {
                if !slot.handler.filter.matches(&message) {
                    return true;
                }
                let delivery = Delivery {
                    message: Arc::clone(&message),
                    _guard: self.barrier.enter(),
                };
                if slot.queue.send(delivery).is_ok() {
                    dispatched += 1;
                }
                !slot.handler.run_once
            });
        }

        debug!(
            channel = %self.name,
            direction = %message.direction(),
            handlers = dispatched,
            "Dispatching message"
        );

        dispatched
    }

    /// Resolve once every dispatched delivery on this channel has finished.
    pub async fn wait_for_delivery(&self) {
        self.barrier.wait().await;
    }

    pub fn barrier(&self) -> &DeliveryBarrier {
        &self.barrier
    }

    /// Whether the channel is bound to `destination` on `connection`.
    pub async fn is_bound_to(&self, connection_id: Uuid, destination: &str) -> bool {
        self.bindings
            .lock()
            .await
            .iter()
            .any(|b| b.connection.id() == connection_id && b.destination == destination)
    }

    /// Destinations this channel is currently bound to.
    pub async fn bound_destinations(&self) -> Vec<String> {
        self.bindings
            .lock()
            .await
            .iter()
            .map(|b| b.destination.clone())
            .collect()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("galactic", &self.is_galactic())
            .finish()
    }
}

#[cfg(test)]
mod tests;
