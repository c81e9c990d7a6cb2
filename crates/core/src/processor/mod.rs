//! Item processing: plugin calls for single items and order packages, and
//! the task handler that routes queued work.

mod executor;
mod item;

pub use executor::TaskExecutor;
pub use item::{ItemProcessor, ProcessOutcome};
