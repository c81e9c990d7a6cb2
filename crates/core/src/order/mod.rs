//! Orders, order items, subscriptions and their persistence.

mod sqlite_store;
mod status;
mod store;
mod types;

pub use sqlite_store::SqliteOrderStore;
pub(crate) use sqlite_store::{parse_ts, ts};
pub use status::{derive_order_status, status_message};
pub use store::{BatchCreation, ItemScope, OrderFilter, OrderStore, StatusChange, StoreError};
pub use types::*;
