//! Error types for the HTTP request pipeline.

use thiserror::Error;

/// Errors produced by the HTTP client core.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The local rate limiter denied the request before it was sent.
    #[error("rate limited before send: {endpoint}")]
    RateLimited {
        /// Identifier of the endpoint that was denied.
        endpoint: &'static str,
    },

    /// Transport-level failure (DNS, TLS, connection reset, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Request or response body could not be serialized/deserialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A `{param}` placeholder in the endpoint template had no value.
    #[error("missing path parameter '{name}' for endpoint {endpoint}")]
    MissingPathParam {
        /// Placeholder name.
        name: String,
        /// Identifier of the endpoint being built.
        endpoint: &'static str,
    },

    /// The retry policy failed validation at construction.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// The interpolated URL did not parse.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Result type for HTTP operations.
pub type HttpResult<T> = Result<T, HttpError>;
