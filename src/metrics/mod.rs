//! Prometheus metrics for the playbook engine.
//!
//! All collectors live in one global registry under the `llm_playbook_engine`
//! namespace. Call [`init_metrics`] once at startup; [`gather_metrics`] renders the
//! text exposition format served on `GET /metrics`.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::time::Instant;

use crate::state::StoreResult;

const NAMESPACE: &str = "llm_playbook_engine";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // HTTP Metrics
    // ============================================================================

    /// Labels: method, path, status_code
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests")
            .namespace(NAMESPACE),
        &["method", "path", "status_code"]
    ).expect("Failed to create HTTP_REQUESTS_TOTAL metric");

    /// Labels: method, path
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "path"]
    ).expect("Failed to create HTTP_REQUEST_DURATION_SECONDS metric");

    // ============================================================================
    // Execution Metrics
    // ============================================================================

    /// Executions that reached a terminal state
    ///
    /// Labels: playbook_id, status
    pub static ref EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("executions_total", "Total number of finished playbook executions")
            .namespace(NAMESPACE),
        &["playbook_id", "status"]
    ).expect("Failed to create EXECUTIONS_TOTAL metric");

    /// Labels: playbook_id
    pub static ref EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "execution_duration_seconds",
            "Playbook execution duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["playbook_id"]
    ).expect("Failed to create EXECUTION_DURATION_SECONDS metric");

    /// Executions currently driven by a coordinator
    pub static ref EXECUTIONS_ACTIVE: Gauge = Gauge::with_opts(
        Opts::new("executions_active", "Number of executions in progress")
            .namespace(NAMESPACE)
    ).expect("Failed to create EXECUTIONS_ACTIVE metric");

    // ============================================================================
    // Step Metrics
    // ============================================================================

    /// Labels: action, status
    pub static ref STEP_RESULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("step_results_total", "Total number of recorded step results")
            .namespace(NAMESPACE),
        &["action", "status"]
    ).expect("Failed to create STEP_RESULTS_TOTAL metric");

    /// Handler invocations per dispatched step
    ///
    /// Labels: action
    pub static ref STEP_ATTEMPTS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("step_attempts", "Attempts made per dispatched step")
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0]),
        &["action"]
    ).expect("Failed to create STEP_ATTEMPTS metric");

    /// Labels: action
    pub static ref STEP_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("step_duration_seconds", "Step duration including retries")
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["action"]
    ).expect("Failed to create STEP_DURATION_SECONDS metric");

    // ============================================================================
    // Storage Metrics
    // ============================================================================

    /// Labels: operation, backend, result
    pub static ref STORAGE_OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("storage_operations_total", "Total number of storage operations")
            .namespace(NAMESPACE),
        &["operation", "backend", "result"]
    ).expect("Failed to create STORAGE_OPERATIONS_TOTAL metric");

    /// Labels: operation, backend
    pub static ref STORAGE_OPERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "storage_operation_duration_seconds",
            "Storage operation duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["operation", "backend"]
    ).expect("Failed to create STORAGE_OPERATION_DURATION_SECONDS metric");

    /// Store writes retried after an availability failure
    ///
    /// Labels: operation
    pub static ref STORE_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("store_retries_total", "Total number of retried store operations")
            .namespace(NAMESPACE),
        &["operation"]
    ).expect("Failed to create STORE_RETRIES_TOTAL metric");

    // ============================================================================
    // Error & System Metrics
    // ============================================================================

    /// Labels: kind
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("errors_total", "Total number of hard errors")
            .namespace(NAMESPACE),
        &["kind"]
    ).expect("Failed to create ERRORS_TOTAL metric");

    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Build information")
            .namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");
}

fn register<C: Collector + Clone + 'static>(collector: &C) -> Result<(), prometheus::Error> {
    match PROMETHEUS_REGISTRY.register(Box::new(collector.clone())) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register all collectors with the global registry. Safe to call more than once.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    register(&*HTTP_REQUESTS_TOTAL)?;
    register(&*HTTP_REQUEST_DURATION_SECONDS)?;

    register(&*EXECUTIONS_TOTAL)?;
    register(&*EXECUTION_DURATION_SECONDS)?;
    register(&*EXECUTIONS_ACTIVE)?;

    register(&*STEP_RESULTS_TOTAL)?;
    register(&*STEP_ATTEMPTS)?;
    register(&*STEP_DURATION_SECONDS)?;

    register(&*STORAGE_OPERATIONS_TOTAL)?;
    register(&*STORAGE_OPERATION_DURATION_SECONDS)?;
    register(&*STORE_RETRIES_TOTAL)?;

    register(&*ERRORS_TOTAL)?;
    register(&*BUILD_INFO)?;

    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Generate Prometheus text format metrics
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}

/// Record the outcome and latency of a store operation
pub fn record_storage_operation<T>(
    operation: &str,
    backend: &str,
    start: Instant,
    result: &StoreResult<T>,
) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    STORAGE_OPERATIONS_TOTAL
        .with_label_values(&[operation, backend, outcome])
        .inc();
    STORAGE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, backend])
        .observe(start.elapsed().as_secs_f64());
}

/// Axum middleware counting requests by matched route
pub async fn track_http(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), path.as_str(), status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StoreError;

    #[test]
    fn test_metrics_initialization_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_storage_operation_recording() {
        let ok: StoreResult<()> = Ok(());
        let err: StoreResult<()> = Err(StoreError::Unavailable("down".to_string()));
        record_storage_operation("test_op", "unit", Instant::now(), &ok);
        record_storage_operation("test_op", "unit", Instant::now(), &err);

        assert!(
            STORAGE_OPERATIONS_TOTAL
                .with_label_values(&["test_op", "unit", "ok"])
                .get()
                >= 1.0
        );
        assert!(
            STORAGE_OPERATIONS_TOTAL
                .with_label_values(&["test_op", "unit", "error"])
                .get()
                >= 1.0
        );
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().unwrap();
        STEP_RESULTS_TOTAL
            .with_label_values(&["wait", "success"])
            .inc();
        let metrics = gather_metrics();
        assert!(metrics.contains("llm_playbook_engine_step_results_total"));
    }
}
