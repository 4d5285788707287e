//! Bus transactions.
//!
//! A transaction groups channel requests and store-readiness waits into one
//! completion or abort event. Requests are queued while the transaction is
//! uncommitted; `commit` starts them and returns immediately. Outcomes are
//! reported through the `on_complete` / `on_error` callbacks.
//!
//! - Sync transactions run requests one after another in registration order.
//! - Async transactions start every request at commit.
//!
//! Responses are always reported in registration order. The first error
//! aborts the transaction; anything arriving afterwards is discarded.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{handler_fn, ChannelManager, Direction, Message, MessageFilter};
use crate::store::StoreManager;

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Errors that can occur building or committing a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Transaction is already committed")]
    AlreadyCommitted,

    #[error("Transaction has no requests")]
    EmptyTransaction,

    #[error("Channel '{0}' does not exist")]
    ChannelNotFound(String),

    #[error("Store '{0}' does not exist")]
    StoreNotFound(String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Uncommitted,
    Committed,
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
enum PendingRequest {
    Channel { channel: String, payload: Value },
    StoreReady { store: String },
}

type CompleteFn = Arc<dyn Fn(Vec<Arc<Message>>) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(Arc<Message>) + Send + Sync>;

struct TransactionInner {
    state: TransactionState,
    requests: Vec<PendingRequest>,
    responses: Vec<Option<Arc<Message>>>,
    on_complete: Vec<CompleteFn>,
    on_error: Vec<ErrorFn>,
}

/// Single-use coordinator for a group of bus requests.
pub struct BusTransaction {
    id: Uuid,
    kind: TransactionType,
    channels: Arc<ChannelManager>,
    stores: Arc<StoreManager>,
    inner: Arc<Mutex<TransactionInner>>,
}

impl BusTransaction {
    pub fn new(kind: TransactionType, channels: Arc<ChannelManager>, stores: Arc<StoreManager>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            channels,
            stores,
            inner: Arc::new(Mutex::new(TransactionInner {
                state: TransactionState::Uncommitted,
                requests: Vec::new(),
                responses: Vec::new(),
                on_complete: Vec::new(),
                on_error: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    /// Queue a request on a channel. Its reply becomes this request's response.
    pub async fn send_request(&self, channel: &str, payload: impl Serialize) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.queue(PendingRequest::Channel {
            channel: channel.to_string(),
            payload,
        })
        .await
    }

    /// Queue a wait for a store to become ready. The response is a snapshot
    /// of the store's items at that moment.
    pub async fn wait_for_store_ready(&self, store: &str) -> Result<()> {
        self.queue(PendingRequest::StoreReady {
            store: store.to_string(),
        })
        .await
    }

    /// Register a callback for successful completion.
    pub async fn on_complete<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Vec<Arc<Message>>) + Send + Sync + 'static,
    {
        let mut inner = self.uncommitted().await?;
        inner.on_complete.push(Arc::new(f));
        Ok(())
    }

    /// Register a callback for the aborting error.
    pub async fn on_error<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<Message>) + Send + Sync + 'static,
    {
        let mut inner = self.uncommitted().await?;
        inner.on_error.push(Arc::new(f));
        Ok(())
    }

    /// Start executing the queued requests.
    ///
    /// Fails without side effects when a referenced channel or store does not
    /// exist.
    pub async fn commit(&self) -> Result<()> {
        let mut inner = self.uncommitted().await?;
        if inner.requests.is_empty() {
            return Err(TransactionError::EmptyTransaction);
        }
        for request in &inner.requests {
            match request {
                PendingRequest::Channel { channel, .. } => {
                    if !self.channels.check_channel_exists(channel).await {
                        return Err(TransactionError::ChannelNotFound(channel.clone()));
                    }
                }
                PendingRequest::StoreReady { store } => {
                    if !self.stores.check_store_exists(store).await {
                        return Err(TransactionError::StoreNotFound(store.clone()));
                    }
                }
            }
        }

        inner.state = TransactionState::Committed;
        inner.responses = vec![None; inner.requests.len()];
        let requests = inner.requests.clone();
        drop(inner);

        info!(transaction = %self.id, kind = ?self.kind, requests = requests.len(), "Transaction committed");
        let runner = Runner {
            id: self.id,
            channels: Arc::clone(&self.channels),
            stores: Arc::clone(&self.stores),
            inner: Arc::clone(&self.inner),
        };
        match self.kind {
            TransactionType::Sync => {
                tokio::spawn(async move {
                    for (index, request) in requests.into_iter().enumerate() {
                        let reply = runner.execute(request).await;
                        if !runner.record(index, reply).await {
                            break;
                        }
                    }
                });
            }
            TransactionType::Async => {
                let runner = Arc::new(runner);
                for (index, request) in requests.into_iter().enumerate() {
                    let runner = Arc::clone(&runner);
                    tokio::spawn(async move {
                        let reply = runner.execute(request).await;
                        runner.record(index, reply).await;
                    });
                }
            }
        }
        Ok(())
    }

    async fn queue(&self, request: PendingRequest) -> Result<()> {
        let mut inner = self.uncommitted().await?;
        inner.requests.push(request);
        Ok(())
    }

    async fn uncommitted(&self) -> Result<tokio::sync::MutexGuard<'_, TransactionInner>> {
        let inner = self.inner.lock().await;
        if inner.state != TransactionState::Uncommitted {
            return Err(TransactionError::AlreadyCommitted);
        }
        Ok(inner)
    }
}

impl std::fmt::Debug for BusTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Executes the requests of a committed transaction.
struct Runner {
    id: Uuid,
    channels: Arc<ChannelManager>,
    stores: Arc<StoreManager>,
    inner: Arc<Mutex<TransactionInner>>,
}

impl Runner {
    /// Run one request to its outcome. Failures come back as error messages.
    async fn execute(&self, request: PendingRequest) -> Arc<Message> {
        match request {
            PendingRequest::Channel { channel, payload } => {
                self.request_reply(&channel, payload).await
            }
            PendingRequest::StoreReady { store } => self.store_snapshot(&store).await,
        }
    }

    async fn request_reply(&self, channel: &str, payload: Value) -> Arc<Message> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel::<Arc<Message>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let callback = handler_fn(move |msg: Arc<Message>| {
            let slot = Arc::clone(&slot);
            async move {
                if let Some(tx) = slot.lock().await.take() {
                    let _ = tx.send(msg);
                }
            }
        });
        let filter = MessageFilter::directions(&[Direction::Response, Direction::Error])
            .with_correlation(correlation_id);

        if let Err(e) = self
            .channels
            .subscribe_handler_with_id(channel, correlation_id, filter, callback, true)
            .await
        {
            return failure(channel, e.to_string());
        }
        debug!(transaction = %self.id, channel = %channel, correlation = %correlation_id, "Transaction request sent");
        if let Err(e) = self
            .channels
            .send(Message::request(channel, payload, Some(correlation_id)))
            .await
        {
            return failure(channel, e.to_string());
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => failure(channel, format!("Channel '{channel}' closed before replying")),
        }
    }

    async fn store_snapshot(&self, name: &str) -> Arc<Message> {
        let store = match self.stores.get_store(name).await {
            Ok(store) => store,
            Err(e) => return failure(name, e.to_string()),
        };
        store.ready().await;
        match serde_json::to_value(store.all_values_as_map().await) {
            Ok(values) => Arc::new(Message::response(name, values, None)),
            Err(e) => failure(name, e.to_string()),
        }
    }

    /// Record a request outcome. Returns whether the transaction is still
    /// running.
    async fn record(&self, index: usize, reply: Arc<Message>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != TransactionState::Committed {
            debug!(transaction = %self.id, index, "Late response discarded");
            return false;
        }

        if reply.is_error() {
            inner.state = TransactionState::Aborted;
            let handlers = inner.on_error.clone();
            drop(inner);
            warn!(transaction = %self.id, index, error = %reply.error_text(), "Transaction aborted");
            for handler in handlers {
                handler(Arc::clone(&reply));
            }
            return false;
        }

        inner.responses[index] = Some(reply);
        if inner.responses.iter().any(Option::is_none) {
            return true;
        }

        inner.state = TransactionState::Completed;
        let responses: Vec<Arc<Message>> = inner.responses.iter().flatten().cloned().collect();
        let handlers = inner.on_complete.clone();
        drop(inner);
        info!(transaction = %self.id, responses = responses.len(), "Transaction completed");
        for handler in handlers {
            handler(responses.clone());
        }
        true
    }
}

fn failure(channel: &str, text: String) -> Arc<Message> {
    Arc::new(Message::error(channel, Value::String(text), None))
}
