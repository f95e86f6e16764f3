//! Prometheus metrics for bytebin.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the per-request middleware, and
//! exposes the `/metrics` endpoint handler.

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::errors::HttpError;

// -- Metric name constants ----------------------------------------------------

/// Total handled requests (counter). Labels: method, useragent.
pub const REQUESTS_TOTAL: &str = "bytebin_requests_total";

/// Total rejected requests (counter). Labels: method, reason, useragent.
pub const REJECTED_REQUESTS_TOTAL: &str = "bytebin_rejected_requests_total";

/// Request handling duration in seconds (histogram). Labels: method.
pub const REQUEST_DURATION_SECONDS: &str = "bytebin_request_duration_seconds";

/// In-flight requests (gauge). Labels: method.
pub const REQUESTS_ACTIVE: &str = "bytebin_requests_active";

/// Size of posted content in bytes (histogram). Labels: useragent.
pub const CONTENT_SIZE_BYTES: &str = "bytebin_content_size_bytes";

/// Number of stored content items (gauge). Labels: type, backend.
pub const STORED_CONTENT_COUNT: &str = "bytebin_content";

/// Size in bytes of stored content (gauge). Labels: type, backend.
pub const STORED_CONTENT_SIZE: &str = "bytebin_content_size";

/// Index database transaction duration in seconds (histogram). Labels: operation.
pub const DB_TRANSACTION_DURATION_SECONDS: &str = "bytebin_db_transaction_duration_seconds";

/// Index database errors (counter). Labels: operation.
pub const DB_ERROR_TOTAL: &str = "bytebin_db_error_total";

/// Backend reads, i.e. cache misses (counter). Labels: backend.
pub const BACKEND_READ_TOTAL: &str = "bytebin_backend_read_total";

/// Backend writes (counter). Labels: backend.
pub const BACKEND_WRITE_TOTAL: &str = "bytebin_backend_write_total";

/// Backend deletes (counter). Labels: backend.
pub const BACKEND_DELETE_TOTAL: &str = "bytebin_backend_delete_total";

/// Backend read duration in seconds (histogram). Labels: backend.
pub const BACKEND_READ_DURATION_SECONDS: &str = "bytebin_backend_read_duration_seconds";

/// Backend write duration in seconds (histogram). Labels: backend.
pub const BACKEND_WRITE_DURATION_SECONDS: &str = "bytebin_backend_write_duration_seconds";

/// Backend delete duration in seconds (histogram). Labels: backend.
pub const BACKEND_DELETE_DURATION_SECONDS: &str = "bytebin_backend_delete_duration_seconds";

/// Backend errors (counter). Labels: backend, operation.
pub const BACKEND_ERROR_TOTAL: &str = "bytebin_backend_error_total";

/// Uncaught errors (counter). Labels: type.
pub const UNCAUGHT_ERROR_TOTAL: &str = "bytebin_uncaught_error_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to
/// call multiple times (e.g. in tests).
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "The amount of requests handled");
    describe_counter!(REJECTED_REQUESTS_TOTAL, "The amount of rejected requests");
    describe_histogram!(REQUEST_DURATION_SECONDS, "The duration to handle requests");
    describe_gauge!(REQUESTS_ACTIVE, "The amount of active in-flight requests");
    describe_histogram!(CONTENT_SIZE_BYTES, "The size of posted content");
    describe_gauge!(STORED_CONTENT_COUNT, "The number of stored content items");
    describe_gauge!(STORED_CONTENT_SIZE, "The size (bytes) of stored content");
    describe_histogram!(DB_TRANSACTION_DURATION_SECONDS, "The duration to query the db");
    describe_counter!(
        DB_ERROR_TOTAL,
        "Counts errors that have occurred when interacting with the index database"
    );
    describe_counter!(
        BACKEND_READ_TOTAL,
        "Counts cache-misses when loading content"
    );
    describe_counter!(
        BACKEND_WRITE_TOTAL,
        "Counts the number of times content was written to the backend"
    );
    describe_counter!(
        BACKEND_DELETE_TOTAL,
        "Counts the number of times content was deleted from the backend"
    );
    describe_histogram!(
        BACKEND_READ_DURATION_SECONDS,
        "The duration to read from the backend"
    );
    describe_histogram!(
        BACKEND_WRITE_DURATION_SECONDS,
        "The duration to write to the backend"
    );
    describe_histogram!(
        BACKEND_DELETE_DURATION_SECONDS,
        "The duration to delete from the backend"
    );
    describe_counter!(
        BACKEND_ERROR_TOTAL,
        "Counts errors that have occurred when interacting with the backend"
    );
    describe_counter!(
        UNCAUGHT_ERROR_TOTAL,
        "Counts uncaught errors that have occurred"
    );
}

// -- Request labelling --------------------------------------------------------

/// The user-agent label used on request counters: the Origin header when
/// present, else the User-Agent, else "unknown". Keeps cardinality down
/// while still attributing traffic to its source.
pub fn metrics_label(headers: &HeaderMap) -> String {
    headers
        .get("origin")
        .or_else(|| headers.get("user-agent"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Record a handled request on the requests counter.
pub fn record_request(method: &str, headers: &HeaderMap) {
    counter!(REQUESTS_TOTAL, "method" => method.to_string(), "useragent" => metrics_label(headers))
        .increment(1);
}

/// Record a rejected request with the given reason.
pub fn record_rejected_request(method: &str, reason: &'static str, headers: &HeaderMap) {
    counter!(
        REJECTED_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "reason" => reason,
        "useragent" => metrics_label(headers)
    )
    .increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware recording the per-method duration histogram and the
/// in-flight gauge. Must be the outermost layer so it captures the full
/// request lifecycle. `/metrics` itself is not instrumented.
pub async fn metrics_middleware(req: Request<Body>, next: axum::middleware::Next) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    gauge!(REQUESTS_ACTIVE, "method" => method.clone()).increment(1.0);
    let start = Instant::now();

    let response = next.run(req).await;

    histogram!(REQUEST_DURATION_SECONDS, "method" => method.clone())
        .record(start.elapsed().as_secs_f64());
    gauge!(REQUESTS_ACTIVE, "method" => method).decrement(1.0);

    response
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- render the Prometheus exposition text.
///
/// Requests arriving through the reverse proxy (detected by the presence
/// of `X-Forwarded-For`) are denied so metrics never leak publicly.
pub async fn metrics_handler(headers: HeaderMap) -> Result<Response, HttpError> {
    if headers.contains_key("x-forwarded-for") {
        return Err(HttpError::unauthorized("Unauthorized"));
    }

    let handle = init_metrics();
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_metrics_label_prefers_origin() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        headers.insert("origin", HeaderValue::from_static("https://example.org"));
        assert_eq!(metrics_label(&headers), "https://example.org");
    }

    #[test]
    fn test_metrics_label_falls_back_to_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        assert_eq!(metrics_label(&headers), "curl/8.0");
    }

    #[test]
    fn test_metrics_label_unknown() {
        assert_eq!(metrics_label(&HeaderMap::new()), "unknown");
    }

    #[tokio::test]
    async fn test_metrics_denied_behind_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        let err = metrics_handler(headers).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_metrics_render_ok() {
        let response = metrics_handler(HeaderMap::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
