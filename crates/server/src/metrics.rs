//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the engine:
//! - HTTP request metrics for the operations endpoint
//! - Task queue and worker pool status (collected dynamically)
//! - Sweep scheduler status (collected dynamically)
//! - Core engine counters registered from `oseo_core::metrics`

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "oseo_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oseo_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "oseo_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Queue Metrics (collected dynamically)
// =============================================================================

/// Tasks by current status.
pub static QUEUE_TASKS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("oseo_queue_tasks", "Current task count by status"),
        &["status"],
    )
    .unwrap()
});

/// Tasks currently executing.
pub static WORKERS_BUSY: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("oseo_workers_busy", "Number of workers executing a task").unwrap()
});

/// Worker pool running state (1 = running, 0 = stopped).
pub static WORKER_POOL_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "oseo_worker_pool_running",
        "Whether the worker pool is running (1) or stopped (0)",
    )
    .unwrap()
});

// =============================================================================
// Scheduler Metrics (collected dynamically)
// =============================================================================

/// Scheduler running state (1 = running, 0 = stopped).
pub static SCHEDULER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "oseo_scheduler_running",
        "Whether the sweep scheduler is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Subscriptions still producing batches.
pub static ACTIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "oseo_active_subscriptions",
        "Number of active subscriptions",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Queue
    registry.register(Box::new(QUEUE_TASKS.clone())).unwrap();
    registry.register(Box::new(WORKERS_BUSY.clone())).unwrap();
    registry
        .register(Box::new(WORKER_POOL_RUNNING.clone()))
        .unwrap();

    // Scheduler
    registry
        .register(Box::new(SCHEDULER_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(ACTIVE_SUBSCRIPTIONS.clone()))
        .unwrap();

    // Core metrics (tasks, lifecycle, sweeps, notifications)
    for metric in oseo_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so the gauges reflect the queue and scheduler as
/// they are now.
pub fn collect_dynamic_metrics(state: &AppState) {
    let pool = state.pool().status();
    WORKER_POOL_RUNNING.set(i64::from(pool.running));
    WORKERS_BUSY.set(pool.busy as i64);
    for (status, count) in [
        ("pending", pool.queue.pending),
        ("running", pool.queue.running),
        ("succeeded", pool.queue.succeeded),
        ("failed_retryable", pool.queue.failed_retryable),
        ("failed_terminal", pool.queue.failed_terminal),
    ] {
        QUEUE_TASKS.with_label_values(&[status]).set(count);
    }

    let scheduler = state.scheduler().status();
    SCHEDULER_RUNNING.set(i64::from(scheduler.running));
    ACTIVE_SUBSCRIPTIONS.set(scheduler.active_subscriptions as i64);
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    static UUID_REGEX: Lazy<regex_lite::Regex> = Lazy::new(|| {
        regex_lite::Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .unwrap()
    });
    static NUMERIC_REGEX: Lazy<regex_lite::Regex> =
        Lazy::new(|| regex_lite::Regex::new(r"/\d+(/|$)").unwrap());

    let result = UUID_REGEX.replace_all(path, "{id}");
    let result = NUMERIC_REGEX.replace_all(&result, "/{id}$1");
    result.to_string()
}
