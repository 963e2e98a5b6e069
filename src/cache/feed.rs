//! Change-feed subscription abstraction.
//!
//! Transports (socket, server-sent events, polling) implement [`ChangeFeed`]
//! and push events into the channel behind a [`Subscription`]. Dropping the
//! sending half is how a transport reports a lost connection.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::error::FeedError;
use super::events::ChangeEvent;

pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start receiving events for `resources`.
    async fn subscribe(&self, resources: &[String]) -> Result<Subscription, FeedError>;
}

/// Receiving end of one change-feed subscription.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    resources: Vec<String>,
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Create a subscription plus the sender a transport feeds it through.
    pub fn channel(resources: Vec<String>, capacity: usize) -> (mpsc::Sender<ChangeEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let subscription = Self {
            id: Uuid::new_v4(),
            resources,
            receiver,
        };
        (sender, subscription)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Next event, or `None` once the transport has dropped the connection.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Drive `handler` for every event on a background task.
    pub fn on_event<F>(mut self, mut handler: F) -> EventHandlerTask
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let id = self.id;
        let task = tokio::spawn(async move {
            while let Some(event) = self.recv().await {
                handler(event);
            }
            debug!(subscription_id = %self.id, "Change feed subscription ended");
        });
        EventHandlerTask { id, task }
    }

    /// Stop receiving. Events already queued are discarded.
    pub fn unsubscribe(mut self) {
        self.receiver.close();
        debug!(
            subscription_id = %self.id,
            resources = ?self.resources,
            "Change feed unsubscribed"
        );
    }
}

/// Handle for a subscription driven by [`Subscription::on_event`].
#[derive(Debug)]
pub struct EventHandlerTask {
    id: Uuid,
    task: JoinHandle<()>,
}

impl EventHandlerTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn unsubscribe(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}
