use std::{pin::Pin, sync::Arc};

use data_model::Notification;
use futures::{Stream, StreamExt};
use kv_store::KvStore;
use tracing::{debug, warn};

use crate::error::SyncError;

pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Publishes change notifications on the shared topic.
#[derive(Clone)]
pub struct NotificationPublisher {
    store: Arc<dyn KvStore>,
    channel: String,
}

impl NotificationPublisher {
    pub fn new(store: Arc<dyn KvStore>, channel: String) -> Self {
        Self { store, channel }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, notification: &Notification) -> Result<(), SyncError> {
        let message = notification.to_string();
        self.store.publish(&self.channel, &message).await?;
        debug!(channel = self.channel, message, "published notification");
        Ok(())
    }

    /// Notifications published on the topic from now on. Messages that do not
    /// parse are logged and skipped.
    pub async fn subscribe(&self) -> Result<NotificationStream, SyncError> {
        let messages = self.store.subscribe(&self.channel).await?;
        let notifications = messages.filter_map(|message| async move {
            match message.parse::<Notification>() {
                Ok(notification) => Some(notification),
                Err(err) => {
                    warn!("skipping notification: {}", err);
                    None
                }
            }
        });
        Ok(Box::pin(notifications))
    }
}
