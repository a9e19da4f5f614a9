//! Error types for the Stegodon federation core.
//!
//! All errors are converted to `AppError`, which implements `IntoResponse`
//! for proper HTTP error responses and increments `errors_total` the way the
//! teacher's error type does.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type. Variants line up with the error kinds named
/// in the federation core's error handling design: malformed input,
/// signature failure modes, authorization, not-found, rate limiting,
/// conflict (reported 202 per ActivityPub convention), and the delivery
/// worker's transient/permanent retry classification.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Signature invalid")]
    SigInvalid,

    #[error("Signing key unavailable: {0}")]
    SigKeyUnavailable(String),

    #[error("Signature date stale")]
    SigStale,

    #[error("Digest mismatch")]
    DigestMismatch,

    #[error("Not authorized to perform this action")]
    Unauthorized,

    #[error("Resource not found")]
    NotFound,

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Duplicate activity/object; reported to the HTTP caller as 202 per
    /// ActivityPub convention rather than an error status.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Used internally by the delivery worker to schedule a retry; never
    /// returned from an HTTP handler.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Used internally by the delivery worker to drop a delivery task.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Federation error: {0}")]
    Federation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::SigInvalid => (StatusCode::UNAUTHORIZED, "sig_invalid"),
            AppError::SigKeyUnavailable(_) => (StatusCode::UNAUTHORIZED, "sig_key_unavailable"),
            AppError::SigStale => (StatusCode::UNAUTHORIZED, "sig_stale"),
            AppError::DigestMismatch => (StatusCode::UNAUTHORIZED, "digest_mismatch"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            AppError::Conflict(_) => (StatusCode::ACCEPTED, "conflict"),
            AppError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
            AppError::Permanent(_) => (StatusCode::BAD_REQUEST, "permanent"),
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, kind) = self.status_and_kind();

        // Conflict (duplicate activity) is reported as success per
        // ActivityPub convention: the caller gets 202 with no body detail.
        let message = match &self {
            AppError::Conflict(_) => "accepted".to_string(),
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        crate::metrics::ERRORS_TOTAL.with_label_values(&[kind]).inc();

        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
