//! Handler-visible error type.
//!
//! Handlers return `Result<Response, HttpError>`; the [`IntoResponse`]
//! impl renders the error as `(status, text/plain message)`. Unexpected
//! internal errors are logged, counted, and collapsed into a generic
//! `404 Invalid path` so no backend detail ever reaches a client.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::metrics::UNCAUGHT_ERROR_TOTAL;

/// An error carrying the HTTP status and plain-text message to send.
#[derive(Debug, Error)]
#[error("{status} {message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, message)
    }

    pub fn content_too_large() -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "Content too large")
    }

    pub fn rate_limit_exceeded() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")
    }
}

impl From<anyhow::Error> for HttpError {
    /// Terminal mapper for unexpected errors: log, count, 404.
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("error thrown by handler: {err:#}");
        metrics::counter!(UNCAUGHT_ERROR_TOTAL, "type" => "handler").increment(1);
        Self::not_found("Invalid path")
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "text/plain")],
            self.message,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_status() {
        assert_eq!(
            HttpError::bad_request("Missing content").status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HttpError::content_too_large().status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            HttpError::rate_limit_exceeded().status,
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_unexpected_errors_collapse_to_404() {
        let err: HttpError = anyhow::anyhow!("sqlite exploded").into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Invalid path");
    }

    #[test]
    fn test_into_response_is_plain_text() {
        let response = HttpError::forbidden("Incorrect modification key").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }
}
