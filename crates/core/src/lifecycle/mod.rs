//! Order, item and subscription state transitions.

mod locks;
mod manager;
mod types;

pub use locks::ItemLocks;
pub use manager::LifecycleManager;
pub use types::{CancelReport, CompletionEvent, LifecycleError, TransitionOutcome};
