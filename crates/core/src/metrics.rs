//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Task queue (executions, durations, retries)
//! - Order lifecycle (item transitions, finished orders, subscriptions)
//! - Sweeps and subscription batches
//! - Notifications

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Task queue
// =============================================================================

/// Task executions by kind and outcome.
pub static TASKS_EXECUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_tasks_executed_total", "Total task executions"),
        &["kind", "outcome"], // "succeeded", "rescheduled", "failed", "deferred"
    )
    .unwrap()
});

/// Task execution duration in seconds.
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("oseo_task_duration_seconds", "Duration of task executions")
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0]),
        &["kind"],
    )
    .unwrap()
});

/// Retries scheduled after retryable failures.
pub static TASK_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_task_retries_total", "Total task retries scheduled"),
        &["kind"],
    )
    .unwrap()
});

// =============================================================================
// Order lifecycle
// =============================================================================

/// Item transitions by target status.
pub static ITEM_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_item_transitions_total", "Total order item transitions"),
        &["to"],
    )
    .unwrap()
});

/// Orders reaching a terminal status.
pub static ORDERS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_orders_finished_total", "Total orders reaching a final status"),
        &["status"],
    )
    .unwrap()
});

/// Subscriptions terminated.
pub static SUBSCRIPTIONS_TERMINATED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "oseo_subscriptions_terminated_total",
        "Total subscriptions terminated",
    )
    .unwrap()
});

// =============================================================================
// Sweeps
// =============================================================================

/// Sweep runs by sweep and result.
pub static SWEEP_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_sweep_runs_total", "Total scheduler sweep runs"),
        &["sweep", "result"], // sweep: "advance", "expiry", "recovery"; result: "ok", "error"
    )
    .unwrap()
});

/// Subscription batches created.
pub static BATCHES_DISPATCHED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "oseo_batches_dispatched_total",
        "Total subscription batches dispatched",
    )
    .unwrap()
});

// =============================================================================
// Notifications
// =============================================================================

/// Notifications by kind and delivery result.
pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_notifications_total", "Total notifications handed to the notifier"),
        &["kind", "result"], // result: "sent", "failed"
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Task queue
        Box::new(TASKS_EXECUTED.clone()),
        Box::new(TASK_DURATION.clone()),
        Box::new(TASK_RETRIES.clone()),
        // Lifecycle
        Box::new(ITEM_TRANSITIONS.clone()),
        Box::new(ORDERS_FINISHED.clone()),
        Box::new(SUBSCRIPTIONS_TERMINATED.clone()),
        // Sweeps
        Box::new(SWEEP_RUNS.clone()),
        Box::new(BATCHES_DISPATCHED.clone()),
        // Notifications
        Box::new(NOTIFICATIONS.clone()),
    ]
}
