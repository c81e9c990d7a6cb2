//! Periodic sweeps driving time-based transitions.

mod sweeper;

pub use sweeper::{AdvanceReport, ExpiryReport, SchedulerStatus, SweepError, SweepScheduler};
