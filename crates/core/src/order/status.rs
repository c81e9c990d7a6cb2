//! Derivation of order and batch status from item statuses.

use super::{ItemStatus, OrderStatus, PackagingState};

/// Derive the status of an order (or batch) from its items.
///
/// Once every item is terminal:
/// - any `Failed` item fails the order,
/// - otherwise any delivered item completes it, unless the order-level
///   package is still pending (`InProduction`) or failed (`Failed`),
/// - otherwise every item was cancelled.
///
/// While items are still being processed the order is `InProduction` if any
/// item is, else it reports the least advanced non-terminal item.
///
/// An order without items stays `Submitted`.
pub fn derive_order_status(items: &[ItemStatus], packaging: &PackagingState) -> OrderStatus {
    if items.is_empty() {
        return OrderStatus::Submitted;
    }

    if items.iter().all(ItemStatus::is_terminal) {
        if items.contains(&ItemStatus::Failed) {
            return OrderStatus::Failed;
        }
        if items.iter().any(ItemStatus::is_delivered) {
            return match packaging {
                PackagingState::Pending => OrderStatus::InProduction,
                PackagingState::Failed { .. } => OrderStatus::Failed,
                PackagingState::NotRequested | PackagingState::Completed { .. } => {
                    OrderStatus::Completed
                }
            };
        }
        return OrderStatus::Cancelled;
    }

    let pending = items.iter().filter(|s| !s.is_terminal());
    let mut status = OrderStatus::Accepted;
    for item in pending {
        match item {
            ItemStatus::InProduction => return OrderStatus::InProduction,
            ItemStatus::Submitted => status = OrderStatus::Submitted,
            _ => {}
        }
    }
    status
}

/// Status detail recorded alongside a derived status change.
pub fn status_message(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Submitted => "Order is awaiting approval",
        OrderStatus::Accepted => "Order is placed in processing queue",
        OrderStatus::InProduction => "Order is being processed",
        OrderStatus::Completed => "Order has been completed",
        OrderStatus::Failed => "Order has failed",
        OrderStatus::Cancelled => "Order has been cancelled",
        OrderStatus::Terminated => "Subscription has ended",
    }
}
