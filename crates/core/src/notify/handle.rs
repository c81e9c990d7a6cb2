use tokio::sync::mpsc;

use super::Notification;

/// Handle for emitting notifications.
///
/// Cheap to clone. Notifications go through a bounded channel to the
/// [`NotificationDispatcher`](super::NotificationDispatcher); a full or closed
/// channel is logged and never fails the caller.
#[derive(Clone)]
pub struct NotificationHandle {
    tx: mpsc::Sender<Notification>,
}

impl NotificationHandle {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Send a notification, waiting for channel capacity.
    pub async fn emit(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification).await {
            tracing::error!("Failed to emit notification: {}", e);
        }
    }

    /// Send a notification without waiting. Returns false if it was dropped.
    pub fn try_emit(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to emit notification: {}", e);
                false
            }
        }
    }
}
