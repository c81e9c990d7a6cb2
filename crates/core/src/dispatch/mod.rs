//! Batch dispatch: turning orders and subscription timeslots into queued work.

mod dispatcher;

pub use dispatcher::{BatchDispatcher, DispatchError, TimeslotDispatch};
