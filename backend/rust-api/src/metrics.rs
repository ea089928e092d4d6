use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, CounterVec, Encoder, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Durable store
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_store_operations_total",
        "Total number of attempt store operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref STORE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "attempt_store_operation_duration_seconds",
        "Attempt store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .unwrap();

    // State cache (Redis)
    pub static ref CACHE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_operations_total",
        "Total number of cache operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref CACHE_HIT_RATIO: CounterVec = register_counter_vec!(
        "cache_hit_ratio",
        "Cache hit/miss ratio",
        &["result"]
    )
    .unwrap();

    pub static ref ATTEMPT_ACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_actions_total",
        "Attempt endpoint calls by action and response status",
        &["action", "status"]
    )
    .unwrap();

    // Synchronization engine
    pub static ref SAVES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_saves_total",
        "Conditional saves by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref CONFLICTS_RESOLVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempt_conflicts_resolved_total",
        "Fields decided by a conflict strategy",
        &["strategy"]
    )
    .unwrap();

    pub static ref AUTOSAVE_FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "autosave_flushes_total",
        "Auto-save batch flushes by status",
        &["status"]
    )
    .unwrap();

    pub static ref AUTOSAVE_COALESCED_CHANGES_TOTAL: IntCounter = register_int_counter!(
        "autosave_coalesced_changes_total",
        "Change events folded into another change for the same question"
    )
    .unwrap();

    pub static ref SYNC_SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sync_sessions_active",
        "Number of live sync sessions"
    )
    .unwrap();

    pub static ref SYNC_SESSIONS_EVICTED_TOTAL: IntCounter = register_int_counter!(
        "sync_sessions_evicted_total",
        "Sync sessions evicted after the inactivity window"
    )
    .unwrap();

    pub static ref BATCH_ITEMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "batch_items_total",
        "Batch operation items by operation and status",
        &["operation", "status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track store operation with metrics
pub async fn track_store_operation<F, T, E>(operation: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    STORE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    STORE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);

    result
}

/// Helper: track cache operation with metrics
pub async fn track_cache_operation<F, T, E>(operation: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let result = future.await;
    let status = if result.is_ok() { "success" } else { "error" };

    CACHE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    result
}

/// Record cache hit
pub fn record_cache_hit() {
    CACHE_HIT_RATIO.with_label_values(&["hit"]).inc();
}

/// Record cache miss
pub fn record_cache_miss() {
    CACHE_HIT_RATIO.with_label_values(&["miss"]).inc();
}
