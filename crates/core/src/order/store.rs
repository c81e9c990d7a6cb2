//! Order storage trait and types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{
    Batch, DeliveredFile, ItemStatus, Order, OrderItem, OrderStatus, OrderType, PackagingState,
    Subscription, SubscriptionStatus,
};

/// Error type for order storage operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Compare-and-set lost: the stored status is not the expected one.
    #[error("{entity} {id} is {actual}, expected {expected}")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    /// A uniqueness constraint rejected the write.
    #[error("duplicate {0}")]
    Duplicate(String),

    /// The storage engine failed.
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Whether the storage layer itself is unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Old and new value of a derived status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: OrderStatus,
    pub current: OrderStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Result of a batch creation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchCreation {
    /// This call created the batch.
    Created(Batch),
    /// A batch for the same (subscription, timeslot) already existed.
    Existing(Batch),
}

impl BatchCreation {
    pub fn batch(&self) -> &Batch {
        match self {
            BatchCreation::Created(b) | BatchCreation::Existing(b) => b,
        }
    }
}

/// A group of sibling items that finish together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemScope {
    /// All items of a product or massive order.
    Order(String),
    /// All items of one subscription batch.
    Batch(String),
}

impl ItemScope {
    /// Scope an item belongs to.
    pub fn of(item: &OrderItem) -> Self {
        match &item.batch_id {
            Some(batch_id) => ItemScope::Batch(batch_id.clone()),
            None => ItemScope::Order(item.order_id.clone()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ItemScope::Order(id) | ItemScope::Batch(id) => id,
        }
    }
}

/// Filter for querying orders.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    /// Filter by status.
    pub status: Option<OrderStatus>,
    /// Filter by order type.
    pub order_type: Option<OrderType>,
    /// Filter by owner.
    pub ordered_by: Option<String>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl OrderFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_order_type(mut self, order_type: OrderType) -> Self {
        self.order_type = Some(order_type);
        self
    }

    pub fn with_ordered_by(mut self, ordered_by: impl Into<String>) -> Self {
        self.ordered_by = Some(ordered_by.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for order storage backends.
///
/// Every status mutation is a compare-and-set: the write only happens if
/// the stored status still equals `expected`, otherwise `StoreError::Conflict`
/// is returned and nothing changes.
pub trait OrderStore: Send + Sync {
    // --- orders ---

    /// Insert an order with its initial items and, for subscription orders,
    /// its subscription, in a single transaction.
    fn insert_order(
        &self,
        order: &Order,
        items: &[OrderItem],
        subscription: Option<&Subscription>,
    ) -> Result<(), StoreError>;

    fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError>;

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;

    fn count_orders(&self, filter: &OrderFilter) -> Result<i64, StoreError>;

    /// Compare-and-set the stored order status.
    fn update_order_status(
        &self,
        id: &str,
        expected: OrderStatus,
        new: OrderStatus,
        status_info: Option<&str>,
    ) -> Result<Order, StoreError>;

    /// Re-derive the order status from its items and packaging state and
    /// persist it, atomically. Subscription orders and orders already in a
    /// terminal status are left untouched.
    fn refresh_order_status(&self, id: &str) -> Result<StatusChange, StoreError>;

    fn set_packaging(&self, order_id: &str, state: &PackagingState) -> Result<(), StoreError>;

    /// Register the order-level package file and mark packaging completed.
    fn complete_packaging(&self, order_id: &str, file: &DeliveredFile) -> Result<(), StoreError>;

    // --- items ---

    fn get_item(&self, id: &str) -> Result<Option<OrderItem>, StoreError>;

    /// Items of an order, in submission order (batch items included).
    fn list_items(&self, order_id: &str) -> Result<Vec<OrderItem>, StoreError>;

    fn list_scope_items(&self, scope: &ItemScope) -> Result<Vec<OrderItem>, StoreError>;

    /// Number of items in the scope that are not terminal yet.
    fn count_unfinished_items(&self, scope: &ItemScope) -> Result<i64, StoreError>;

    /// Compare-and-set the item status.
    fn update_item_status(
        &self,
        id: &str,
        expected: ItemStatus,
        new: ItemStatus,
        status_info: Option<&str>,
    ) -> Result<OrderItem, StoreError>;

    /// Move the item from `expected` to `InProduction`, counting one attempt.
    fn begin_item_attempt(&self, id: &str, expected: ItemStatus) -> Result<OrderItem, StoreError>;

    /// Move the item from `InProduction` to `Completed` and register its
    /// file, in one transaction.
    fn complete_item(&self, id: &str, file: &DeliveredFile) -> Result<OrderItem, StoreError>;

    // --- subscriptions ---

    fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError>;

    fn list_order_subscriptions(&self, order_id: &str) -> Result<Vec<Subscription>, StoreError>;

    fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    fn update_subscription_status(
        &self,
        id: &str,
        expected: SubscriptionStatus,
        new: SubscriptionStatus,
    ) -> Result<Subscription, StoreError>;

    /// Move the timeslot cursor forward if it still equals `expected`.
    /// Returns false when another sweep already moved it.
    fn advance_subscription(
        &self,
        id: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // --- batches ---

    /// Create the batch for (subscription, timeslot) unless it exists.
    fn create_batch(
        &self,
        subscription_id: &str,
        timeslot: DateTime<Utc>,
    ) -> Result<BatchCreation, StoreError>;

    fn get_batch(&self, id: &str) -> Result<Option<Batch>, StoreError>;

    fn list_batches(&self, subscription_id: &str) -> Result<Vec<Batch>, StoreError>;

    /// Insert the batch items and flag the batch materialized, atomically.
    /// Returns false without writing if the batch was already materialized.
    fn materialize_batch(&self, batch_id: &str, items: &[OrderItem]) -> Result<bool, StoreError>;

    /// Re-derive the batch status from its items.
    fn refresh_batch_status(&self, batch_id: &str) -> Result<StatusChange, StoreError>;

    // --- delivered files ---

    fn get_file(&self, id: &str) -> Result<Option<DeliveredFile>, StoreError>;

    fn list_order_files(&self, order_id: &str) -> Result<Vec<DeliveredFile>, StoreError>;

    /// Available files whose expiry is at or before `now`.
    fn list_expired_files(&self, now: DateTime<Utc>) -> Result<Vec<DeliveredFile>, StoreError>;

    /// Available, not yet warned files expiring in `(now, until]`.
    fn list_files_expiring_before(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DeliveredFile>, StoreError>;

    /// Flag the expiry warning as sent. Returns false if it already was.
    fn mark_file_warned(&self, id: &str) -> Result<bool, StoreError>;

    /// Compare-and-set `available` from true to false. Returns false if the
    /// file was already unavailable.
    fn mark_file_unavailable(&self, id: &str) -> Result<bool, StoreError>;

    /// Count one download of an available file.
    fn record_download(&self, id: &str, at: DateTime<Utc>) -> Result<DeliveredFile, StoreError>;
}
