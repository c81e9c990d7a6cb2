//! Order, item, subscription and delivery data types.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of order a client submitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// One-time order for a fixed list of catalog items.
    Product,
    /// Recurring order producing one batch per timeslot.
    Subscription,
    /// Bulk order over a large list of catalog items.
    Massive,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Product => "product",
            OrderType::Subscription => "subscription",
            OrderType::Massive => "massive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "product" => Some(OrderType::Product),
            "subscription" => Some(OrderType::Subscription),
            "massive" => Some(OrderType::Massive),
            _ => None,
        }
    }
}

/// Status of an order as visible to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    Accepted,
    InProduction,
    Completed,
    Failed,
    Cancelled,
    /// Subscription orders only: every subscription reached its end.
    Terminated,
}

impl OrderStatus {
    /// Returns true if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Failed
                | OrderStatus::Cancelled
                | OrderStatus::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Accepted => "accepted",
            OrderStatus::InProduction => "in_production",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(OrderStatus::Submitted),
            "accepted" => Some(OrderStatus::Accepted),
            "in_production" => Some(OrderStatus::InProduction),
            "completed" => Some(OrderStatus::Completed),
            "failed" => Some(OrderStatus::Failed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "terminated" => Some(OrderStatus::Terminated),
            _ => None,
        }
    }
}

/// Status of a single order item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Submitted,
    Accepted,
    InProduction,
    Completed,
    /// The delivered file passed its retention window.
    Expired,
    Failed,
    Cancelled,
}

impl ItemStatus {
    /// Returns true for states that end item processing.
    ///
    /// `Completed` is terminal for processing purposes even though it may
    /// still move to `Expired`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Expired | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the item delivered something, now or in the past.
    pub fn is_delivered(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Expired)
    }

    /// Whether moving from `self` to `next` is an edge of the item state machine.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        match (self, next) {
            (Submitted, Accepted) => true,
            (Accepted, InProduction) => true,
            // Retry re-entry after a retryable failure.
            (InProduction, InProduction) => true,
            (InProduction, Completed) | (InProduction, Failed) => true,
            (Completed, Expired) => true,
            (from, Cancelled) => from.can_cancel(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Submitted => "submitted",
            ItemStatus::Accepted => "accepted",
            ItemStatus::InProduction => "in_production",
            ItemStatus::Completed => "completed",
            ItemStatus::Expired => "expired",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(ItemStatus::Submitted),
            "accepted" => Some(ItemStatus::Accepted),
            "in_production" => Some(ItemStatus::InProduction),
            "completed" => Some(ItemStatus::Completed),
            "expired" => Some(ItemStatus::Expired),
            "failed" => Some(ItemStatus::Failed),
            "cancelled" => Some(ItemStatus::Cancelled),
            _ => None,
        }
    }
}

/// Lifecycle of a subscription's validity window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    /// The validity window had already closed when the subscription was created.
    Expired,
    /// Ended, either by reaching its end date or by cancellation.
    Terminated,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "expired" => Some(SubscriptionStatus::Expired),
            "terminated" => Some(SubscriptionStatus::Terminated),
            _ => None,
        }
    }
}

/// Processing priority requested by the client.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Standard,
    FastTrack,
}

/// How delivered files reach the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// Client fetches files from the service while they are available.
    #[default]
    OnlineDataAccess,
    /// Files are pushed to a client-supplied location.
    OnlineDataDelivery { target: String },
}

/// Delivery options selected on submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub method: DeliveryMethod,
    /// Packaging format for the order-level archive. `None` delivers items separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packaging: Option<String>,
}

/// State of the order-level packaging step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackagingState {
    #[default]
    NotRequested,
    Pending,
    Completed { location: String },
    Failed { reason: String },
}

// ============================================================================
// Records
// ============================================================================

/// A client order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Human readable detail on the current status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_info: Option<String>,
    pub ordered_by: String,
    /// Client supplied reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub priority: Priority,
    pub delivery: DeliveryOptions,
    /// Parsed order-level options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Parsed protocol extensions.
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
    pub packaging: PackagingState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One catalog item within an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    /// Set for items materialized by a subscription batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Client side identifier of the item within the request.
    pub item_id: String,
    /// Catalog identifier of the item to fetch.
    pub identifier: String,
    pub collection: String,
    /// Parsed option values.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_info: Option<String>,
    /// Processing attempts so far.
    pub attempts: u32,
    /// Delivered file, set when the item completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A file produced for an item, or the packaged archive of a whole order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveredFile {
    pub id: String,
    pub order_id: String,
    /// `None` for the order-level package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_item_id: Option<String>,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// False once the file was deleted; the location is invalid from then on.
    pub available: bool,
    pub downloads: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_downloaded_at: Option<DateTime<Utc>>,
    /// Whether the "expiring soon" notice was already sent.
    pub expiry_warned: bool,
}

impl DeliveredFile {
    /// Create a new available file record.
    ///
    /// The expiry is clamped so it never precedes creation.
    pub fn new(
        order_id: impl Into<String>,
        order_item_id: Option<String>,
        location: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            order_item_id,
            location: location.into(),
            created_at,
            expires_at: expires_at.max(created_at),
            available: true,
            downloads: 0,
            last_downloaded_at: None,
            expiry_warned: false,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A standing subscription created by a subscription order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub order_id: String,
    pub owner: String,
    pub collection: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Length of one timeslot in seconds.
    pub timeslot_secs: u64,
    /// Start of the next timeslot that has not been dispatched yet.
    pub next_timeslot: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Length of one timeslot, or `None` when `timeslot_secs` does not fit
    /// in a `TimeDelta`.
    pub fn timeslot_length(&self) -> Option<TimeDelta> {
        i64::try_from(self.timeslot_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
    }

    /// End of the timeslot starting at `start`, if it is representable.
    pub fn timeslot_end(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.timeslot_length()
            .filter(|length| *length > TimeDelta::zero())
            .and_then(|length| start.checked_add_signed(length))
    }

    /// Start instants of every timeslot that is due at `now`, beginning at
    /// the cursor.
    ///
    /// A timeslot is due once it has fully elapsed and it lies entirely
    /// inside the validity window.
    pub fn due_timeslots(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut slots = Vec::new();
        let mut start = self.next_timeslot;
        // A slot whose end cannot be represented never elapses.
        while let Some(end) = self.timeslot_end(start) {
            if end > now || end > self.end {
                break;
            }
            slots.push(start);
            start = end;
        }
        slots
    }

    /// Whether the validity window closed at `now`.
    pub fn has_ended_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }
}

/// The items materialized for one subscription timeslot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: String,
    pub subscription_id: String,
    pub order_id: String,
    /// Start instant of the timeslot.
    pub timeslot: DateTime<Utc>,
    pub status: OrderStatus,
    /// Whether the batch items were created.
    pub materialized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Submission types
// ============================================================================

/// An order as submitted by the protocol layer, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSpec {
    pub order_type: OrderType,
    pub ordered_by: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub delivery: DeliveryOptions,
    /// Raw order-level options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Raw protocol extensions.
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
    /// Items for product and massive orders.
    #[serde(default)]
    pub items: Vec<ItemSpec>,
    /// Required for subscription orders.
    #[serde(default)]
    pub subscription: Option<SubscriptionSpec>,
}

/// A requested item with raw option values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemSpec {
    pub item_id: String,
    pub identifier: String,
    pub collection: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Subscription part of a subscription order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSpec {
    pub collection: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub requested_begin: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requested_end: Option<DateTime<Utc>>,
    /// Overrides the configured timeslot length.
    #[serde(default)]
    pub timeslot_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_item_transition_graph() {
        use ItemStatus::*;
        assert!(Submitted.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(InProduction));
        assert!(InProduction.can_transition_to(InProduction));
        assert!(InProduction.can_transition_to(Completed));
        assert!(InProduction.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Expired));
        for from in [Submitted, Accepted, InProduction] {
            assert!(from.can_transition_to(Cancelled));
        }

        assert!(!Submitted.can_transition_to(InProduction));
        assert!(!Accepted.can_transition_to(Completed));
        assert!(!Submitted.can_transition_to(Expired));
    }

    #[test]
    fn test_no_transition_leaves_terminal_states_except_expiry() {
        use ItemStatus::*;
        let all = [
            Submitted,
            Accepted,
            InProduction,
            Completed,
            Expired,
            Failed,
            Cancelled,
        ];
        for from in [Expired, Failed, Cancelled] {
            for to in all {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
        for to in all {
            assert_eq!(Completed.can_transition_to(to), to == Expired);
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            ItemStatus::Submitted,
            ItemStatus::InProduction,
            ItemStatus::Expired,
            ItemStatus::Cancelled,
        ] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            OrderStatus::parse(OrderStatus::Terminated.as_str()),
            Some(OrderStatus::Terminated)
        );
        assert_eq!(OrderType::parse("massive"), Some(OrderType::Massive));
        assert_eq!(OrderType::parse("tasking"), None);
    }

    #[test]
    fn test_packaging_state_serialization() {
        let state = PackagingState::Completed {
            location: "/deliveries/o1.tar".to_string(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"type\":\"completed\""));
        let parsed: PackagingState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_delivered_file_expiry_never_precedes_creation() {
        let created = Utc::now();
        let file = DeliveredFile::new("o", None, "/x", created, created - Duration::days(1));
        assert_eq!(file.expires_at, created);
        assert!(file.available);
    }

    fn subscription(begin: DateTime<Utc>, days: i64) -> Subscription {
        Subscription {
            id: "s".to_string(),
            order_id: "o".to_string(),
            owner: "alice".to_string(),
            collection: "S2".to_string(),
            options: BTreeMap::new(),
            begin,
            end: begin + Duration::days(days),
            timeslot_secs: 86400,
            next_timeslot: begin,
            status: SubscriptionStatus::Active,
            created_at: begin,
            updated_at: begin,
        }
    }

    #[test]
    fn test_due_timeslots_only_fully_elapsed() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sub = subscription(t0, 30);

        assert!(sub.due_timeslots(t0 + Duration::hours(23)).is_empty());
        assert_eq!(sub.due_timeslots(t0 + Duration::days(1)), vec![t0]);
        assert_eq!(sub.due_timeslots(t0 + Duration::hours(60)).len(), 2);
    }

    #[test]
    fn test_due_timeslots_bounded_by_end() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sub = subscription(t0, 30);

        let slots = sub.due_timeslots(t0 + Duration::days(45));
        assert_eq!(slots.len(), 30);
        assert_eq!(slots[29], t0 + Duration::days(29));
        assert!(sub.has_ended_at(t0 + Duration::days(30)));
    }

    #[test]
    fn test_due_timeslots_out_of_range_length() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut sub = subscription(t0, 30);
        let far_future = DateTime::<Utc>::MAX_UTC;

        sub.timeslot_secs = 100_000_000_000_000;
        assert!(sub.timeslot_length().is_some());
        assert!(sub.timeslot_end(t0).is_none());
        assert!(sub.due_timeslots(far_future).is_empty());

        sub.timeslot_secs = u64::MAX;
        assert!(sub.timeslot_length().is_none());
        assert!(sub.due_timeslots(far_future).is_empty());
    }

    #[test]
    fn test_due_timeslots_stop_at_max_instant() {
        let t0 = DateTime::<Utc>::MAX_UTC - Duration::days(2);
        let mut sub = subscription(t0, 1);
        sub.end = DateTime::<Utc>::MAX_UTC;

        let slots = sub.due_timeslots(DateTime::<Utc>::MAX_UTC);
        assert_eq!(slots, vec![t0, t0 + Duration::days(1)]);
    }
}
