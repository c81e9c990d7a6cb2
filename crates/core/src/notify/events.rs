//! Notification kinds and payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderAccepted,
    OrderCompleted,
    OrderFailed,
    OrderCancelled,
    OrderAwaitingModeration,
    SubscriptionTerminated,
    SubscriptionBatchAvailable,
    FileExpiringSoon,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderAccepted => "order_accepted",
            NotificationKind::OrderCompleted => "order_completed",
            NotificationKind::OrderFailed => "order_failed",
            NotificationKind::OrderCancelled => "order_cancelled",
            NotificationKind::OrderAwaitingModeration => "order_awaiting_moderation",
            NotificationKind::SubscriptionTerminated => "subscription_terminated",
            NotificationKind::SubscriptionBatchAvailable => "subscription_batch_available",
            NotificationKind::FileExpiringSoon => "file_expiring_soon",
        }
    }

    /// Subject line for the notice.
    pub fn subject(&self) -> &'static str {
        match self {
            NotificationKind::OrderAccepted => "Your order has been accepted",
            NotificationKind::OrderCompleted => "Your order is ready",
            NotificationKind::OrderFailed => "Your order has failed",
            NotificationKind::OrderCancelled => "Your order has been cancelled",
            NotificationKind::OrderAwaitingModeration => "An order is awaiting moderation",
            NotificationKind::SubscriptionTerminated => "Your subscription has ended",
            NotificationKind::SubscriptionBatchAvailable => "New subscription items are available",
            NotificationKind::FileExpiringSoon => "A delivered file will expire soon",
        }
    }
}

/// A notice for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: String,
    /// Values the delivery channel may render: ids, status details, dates.
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, recipient: impl Into<String>) -> Self {
        Self {
            kind,
            recipient: recipient.into(),
            context: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    /// One-line human readable rendering.
    pub fn render(&self) -> String {
        let details: Vec<String> = self
            .context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if details.is_empty() {
            self.kind.subject().to_string()
        } else {
            format!("{} ({})", self.kind.subject(), details.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_context() {
        let n = Notification::new(NotificationKind::OrderCompleted, "alice")
            .with("order_id", "o-1")
            .with("items", 3);
        assert_eq!(n.render(), "Your order is ready (items=3, order_id=o-1)");
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&NotificationKind::FileExpiringSoon).unwrap();
        assert_eq!(json, "\"file_expiring_soon\"");
        assert_eq!(NotificationKind::FileExpiringSoon.as_str(), "file_expiring_soon");
    }
}
