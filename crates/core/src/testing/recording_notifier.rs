//! Notifier recording every notice for assertions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::notify::{Notification, NotificationKind, Notifier, NotifyError};

#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    delivered: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded notifications, in delivery order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }

    /// Recorded notifications of one kind.
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }

    pub fn clear(&self) {
        self.delivered.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
