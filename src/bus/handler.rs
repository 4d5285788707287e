//! Per-subscription message handler.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::channel::{handler_fn, MessageFilter};
use super::manager::ChannelManager;
use super::message::Message;
use super::{BusError, Result};

/// One subscription on a channel.
///
/// Created by the `EventBus` listen/request helpers. Nothing is delivered
/// until [`MessageHandler::handle`] registers the callbacks. A handler built
/// for a request carries the outbound request, which [`MessageHandler::fire`]
/// publishes; replies are matched on the handler id, which doubles as the
/// request's correlation id.
pub struct MessageHandler {
    id: Uuid,
    channel: String,
    run_once: bool,
    filter: MessageFilter,
    request: Option<Message>,
    manager: Arc<ChannelManager>,
    subscription: Mutex<Option<Uuid>>,
}

impl MessageHandler {
    pub(crate) fn new(
        manager: Arc<ChannelManager>,
        channel: impl Into<String>,
        id: Uuid,
        run_once: bool,
        filter: MessageFilter,
        request: Option<Message>,
    ) -> Self {
        Self {
            id,
            channel: channel.into(),
            run_once,
            filter,
            request,
            manager,
            subscription: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_run_once(&self) -> bool {
        self.run_once
    }

    /// Outbound request attached to this handler, if any.
    pub fn request(&self) -> Option<&Message> {
        self.request.as_ref()
    }

    /// Register callbacks. Error-direction messages go to `on_error`,
    /// everything else to `on_success`.
    pub async fn handle<S, E>(&self, on_success: S, on_error: E) -> Result<()>
    where
        S: Fn(Arc<Message>) + Send + Sync + 'static,
        E: Fn(Arc<Message>) + Send + Sync + 'static,
    {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(BusError::HandlerAlreadyActive(self.id));
        }

        let on_success = Arc::new(on_success);
        let on_error = Arc::new(on_error);
        let callback = handler_fn(move |msg: Arc<Message>| {
            let on_success = Arc::clone(&on_success);
            let on_error = Arc::clone(&on_error);
            async move {
                if msg.is_error() {
                    on_error(msg);
                } else {
                    on_success(msg);
                }
            }
        });

        let id = self
            .manager
            .subscribe_handler_with_id(&self.channel, self.id, self.filter.clone(), callback, self.run_once)
            .await?;
        *subscription = Some(id);
        Ok(())
    }

    /// Publish the attached request and wait until the channel has finished
    /// handing it off to its handlers.
    pub async fn fire(&self) -> Result<()> {
        let request = self.request.clone().ok_or(BusError::NoRequestAttached)?;
        let channel = self.manager.get_channel(&self.channel).await?;

        debug!(channel = %self.channel, handler = %self.id, "Firing request");
        channel.send(request).await;
        channel.wait_for_delivery().await;
        Ok(())
    }

    /// Stop receiving messages. Closing an idle handler is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(id) = self.subscription.lock().await.take() else {
            return Ok(());
        };
        match self.manager.unsubscribe_handler(&self.channel, id).await {
            // Channel already destroyed: nothing left to detach from.
            Err(BusError::ChannelNotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Whether callbacks are registered.
    pub async fn is_active(&self) -> bool {
        self.subscription.lock().await.is_some()
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("run_once", &self.run_once)
            .field("has_request", &self.request.is_some())
            .finish()
    }
}
