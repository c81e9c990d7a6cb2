use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{Notification, NotificationHandle};
use crate::metrics;

/// Error reported by a delivery channel.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// External delivery channel (e-mail, webhook, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier writing notices to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            "{}",
            notification.render()
        );
        Ok(())
    }
}

/// Background task forwarding notifications to a [`Notifier`].
pub struct NotificationDispatcher {
    rx: mpsc::Receiver<Notification>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(rx: mpsc::Receiver<Notification>, notifier: Arc<dyn Notifier>) -> Self {
        Self { rx, notifier }
    }

    /// Run until every handle is dropped. Spawn with `tokio::spawn(dispatcher.run())`.
    pub async fn run(mut self) {
        tracing::info!("Notification dispatcher started");

        while let Some(notification) = self.rx.recv().await {
            let result = match self.notifier.notify(&notification).await {
                Ok(()) => "sent",
                Err(e) => {
                    tracing::error!(
                        "Failed to deliver {} notification to {}: {}",
                        notification.kind.as_str(),
                        notification.recipient,
                        e
                    );
                    "failed"
                }
            };
            metrics::NOTIFICATIONS
                .with_label_values(&[notification.kind.as_str(), result])
                .inc();
        }

        tracing::info!("Notification dispatcher shutting down");
    }
}

/// Create a notification system.
///
/// Returns the handle to share across components and the dispatcher to spawn.
pub fn create_notification_system(
    notifier: Arc<dyn Notifier>,
    buffer_size: usize,
) -> (NotificationHandle, NotificationDispatcher) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (
        NotificationHandle::new(tx),
        NotificationDispatcher::new(rx, notifier),
    )
}
