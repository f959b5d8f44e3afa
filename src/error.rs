//! Error types for the relay
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// HTTP signature failure kinds
///
/// Kept separate from `AppError` so the codec can be precise about
/// what went wrong while every kind still maps to 401 at the edge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// No `Signature` header on the request
    #[error("missing signature")]
    SignatureMissing,

    /// `Signature` header present but unparseable or incomplete
    #[error("malformed signature: {0}")]
    SignatureMalformed(String),

    /// The signer's public key could not be fetched or decoded
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),

    /// Recomputed body digest differs from the `Digest` header
    #[error("digest mismatch")]
    DigestMismatch,

    /// `Date` header more than an hour away from server time
    #[error("date header outside accepted window")]
    ClockSkew,

    /// Signing string did not verify against the key
    #[error("signature verification failed")]
    SignatureInvalid,
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed payload or missing field (400)
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid API token (401)
    #[error("authentication required: {0}")]
    Auth(String),

    /// HTTP signature failure (401)
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// Policy engine denial (403)
    #[error("blocked")]
    Blocked,

    /// Missing row or unknown IRI (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Delivery queue is full (503)
    #[error("delivery queue saturated")]
    Backpressure,

    /// Upstream network or database hiccup (502)
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Database error (500)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound HTTP error (502)
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Corrupt config or schema too new; the process exits 2
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Expected errors keep their message; internal errors are logged
    /// with detail and return a generic body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type, log_detail) = match &self {
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "validation", false)
            }
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone(), "auth", false),
            AppError::Signature(err) => (
                StatusCode::UNAUTHORIZED,
                err.to_string(),
                "signature",
                false,
            ),
            AppError::Blocked => (
                StatusCode::FORBIDDEN,
                "blocked".to_string(),
                "blocked",
                false,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), "not_found", false),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), "conflict", false),
            AppError::Backpressure => (
                StatusCode::SERVICE_UNAVAILABLE,
                self.to_string(),
                "backpressure",
                false,
            ),
            AppError::Transient(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream error".to_string(),
                "transient",
                true,
            ),
            AppError::HttpClient(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream HTTP error".to_string(),
                "http_client",
                true,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "database error".to_string(),
                "database",
                true,
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration error".to_string(),
                "config",
                true,
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
                "internal",
                true,
            ),
        };

        if log_detail {
            tracing::error!(error = %self, %error_type, "Request failed with internal details");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        if matches!(self, AppError::Backpressure) {
            return (status, [("Retry-After", "30")], body).into_response();
        }

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
