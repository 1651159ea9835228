//! Error types for core operations.

use thiserror::Error;

/// Errors raised by schema handling and the outbound HTTP client.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Network or HTTP failure while downloading a document.
    #[error("fetch failed: {0}")]
    FetchError(String),

    /// Document is not a usable OpenAPI/Swagger JSON document.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Caller supplied a request that cannot be sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::FetchError(err.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
