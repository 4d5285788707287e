//! Change and mutation streams.
//!
//! A store keeps one [`StreamHub`] for committed changes and one for mutation
//! requests. Each subscribed stream owns an unbounded queue drained by a
//! single tokio task, so a subscriber sees items in publish order and a slow
//! subscriber never stalls the publisher or its peers.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;
use uuid::Uuid;

use super::{Result, StoreChange, StoreError};

/// Decides which published items a stream receives.
pub trait StreamFilter<T>: Send + Sync {
    fn accepts(&self, item: &T) -> bool;
}

/// Filter for committed changes: optional item id, optional state tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub item_id: Option<String>,
    pub states: Vec<String>,
}

impl StreamFilter<StoreChange> for ChangeFilter {
    fn accepts(&self, change: &StoreChange) -> bool {
        if let Some(id) = &self.item_id {
            if id != &change.id {
                return false;
            }
        }
        if self.states.is_empty() {
            return true;
        }
        change
            .state
            .as_ref()
            .is_some_and(|state| self.states.contains(state))
    }
}

/// Filter for mutation requests: accepted request types, empty for all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationFilter {
    pub types: Vec<String>,
}

impl StreamFilter<MutationRequest> for MutationFilter {
    fn accepts(&self, request: &MutationRequest) -> bool {
        self.types.is_empty() || self.types.contains(&request.request_type)
    }
}

type ReplyFn = Arc<dyn Fn(Value) + Send + Sync>;

/// A write request broadcast to mutation streams.
///
/// Every stream that accepts the request may answer it through
/// [`MutationRequest::success`] or [`MutationRequest::error`].
#[derive(Clone)]
pub struct MutationRequest {
    pub request: Value,
    pub request_type: String,
    on_success: ReplyFn,
    on_error: ReplyFn,
}

impl MutationRequest {
    pub(crate) fn new(
        request: Value,
        request_type: impl Into<String>,
        on_success: ReplyFn,
        on_error: ReplyFn,
    ) -> Self {
        Self {
            request,
            request_type: request_type.into(),
            on_success,
            on_error,
        }
    }

    pub fn request_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.request)
    }

    pub fn success(&self, result: Value) {
        (self.on_success)(result)
    }

    pub fn error(&self, error: Value) {
        (self.on_error)(error)
    }
}

impl std::fmt::Debug for MutationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationRequest")
            .field("request_type", &self.request_type)
            .field("request", &self.request)
            .finish()
    }
}

struct HubEntry<T, F> {
    id: Uuid,
    filter: F,
    queue: mpsc::UnboundedSender<T>,
}

/// Registry of subscribed stream queues for one kind of item.
pub(crate) struct StreamHub<T, F> {
    entries: RwLock<Vec<HubEntry<T, F>>>,
}

impl<T, F> StreamHub<T, F>
where
    T: Clone + Send + 'static,
    F: StreamFilter<T> + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Queue `item` for every accepting stream. Returns how many accepted it.
    pub(crate) async fn publish(&self, item: &T) -> usize {
        let entries = self.entries.read().await;
        let mut accepted = 0;
        for entry in entries.iter().filter(|e| e.filter.accepts(item)) {
            if entry.queue.send(item.clone()).is_ok() {
                accepted += 1;
            } else {
                trace!(stream = %entry.id, "Stream worker gone, item dropped");
            }
        }
        accepted
    }

    async fn add(&self, id: Uuid, filter: F, queue: mpsc::UnboundedSender<T>) {
        self.entries.write().await.push(HubEntry { id, filter, queue });
    }

    async fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Drop every subscription. Workers finish what is already queued.
    pub(crate) async fn clear(&self) {
        self.entries.write().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// A filtered view of a store's change or mutation feed.
///
/// Nothing is delivered until [`NotificationStream::subscribe`] is called.
/// A stream can be subscribed once at a time.
pub struct NotificationStream<T, F> {
    id: Uuid,
    filter: F,
    hub: Arc<StreamHub<T, F>>,
    subscribed: Mutex<bool>,
}

/// Stream of committed [`StoreChange`]s.
pub type StoreStream = NotificationStream<StoreChange, ChangeFilter>;

/// Stream of [`MutationRequest`]s.
pub type MutationStream = NotificationStream<MutationRequest, MutationFilter>;

impl<T, F> NotificationStream<T, F>
where
    T: Clone + Send + 'static,
    F: StreamFilter<T> + Clone,
{
    pub(crate) fn new(filter: F, hub: Arc<StreamHub<T, F>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filter,
            hub,
            subscribed: Mutex::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Start delivering items to `handler`, one at a time, in publish order.
    pub async fn subscribe<H, Fut>(&self, handler: H) -> Result<()>
    where
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscribed = self.subscribed.lock().await;
        if *subscribed {
            return Err(StoreError::AlreadySubscribed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        self.hub.add(self.id, self.filter.clone(), tx).await;
        let id = self.id;
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                handler(item).await;
            }
            trace!(stream = %id, "Stream worker stopped");
        });

        *subscribed = true;
        Ok(())
    }

    /// Stop delivery. Items already queued are still handled.
    pub async fn unsubscribe(&self) -> Result<()> {
        let mut subscribed = self.subscribed.lock().await;
        if !*subscribed {
            return Err(StoreError::NotSubscribed);
        }
        // A store reset may already have dropped the entry.
        self.hub.remove(self.id).await;
        *subscribed = false;
        Ok(())
    }

    pub async fn is_subscribed(&self) -> bool {
        *self.subscribed.lock().await
    }
}

impl<T, F: std::fmt::Debug> std::fmt::Debug for NotificationStream<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationStream")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish()
    }
}
