//! Command error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use watchtower_core::CoreError;
use watchtower_proxy::ProxyError;
use watchtower_storage::StorageError;

/// Command errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or invalid command payload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The command conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Proxy engine error.
    #[error("{0}")]
    Proxy(#[from] ProxyError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Schema or outbound request error.
    #[error("{0}")]
    Core(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Proxy(e) => match e {
                ProxyError::PortInUse(_) => (StatusCode::CONFLICT, "port_in_use"),
                ProxyError::PortConflict(_) => (StatusCode::CONFLICT, "port_conflict"),
                ProxyError::BindPermissionDenied(_) => {
                    (StatusCode::FORBIDDEN, "bind_permission_denied")
                }
                ProxyError::InvalidDnsServer(_) => (StatusCode::BAD_REQUEST, "invalid_dns_server"),
                ProxyError::CertIssuanceFailed { .. } => {
                    (StatusCode::BAD_REQUEST, "cert_issuance_failed")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "proxy_error"),
            },
            ApiError::Storage(StorageError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            ApiError::Core(e) => match e {
                CoreError::FetchError(_) => (StatusCode::BAD_GATEWAY, "fetch_error"),
                CoreError::InvalidSchema(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_schema"),
                CoreError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            },
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl From<watchtower_proxy::CaManagerError> for ApiError {
    fn from(e: watchtower_proxy::CaManagerError) -> Self {
        ApiError::Proxy(ProxyError::Ca(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_failures_map_to_conflict() {
        let (status, code) = ApiError::from(ProxyError::PortInUse(8888)).status_and_code();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "port_in_use");

        let (status, _) = ApiError::from(ProxyError::InvalidDnsServer("x".into())).status_and_code();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn schema_errors_are_client_visible() {
        let err = ApiError::from(CoreError::InvalidSchema("missing `paths` object".into()));
        assert_eq!(err.to_string(), "invalid schema: missing `paths` object");
        assert_eq!(err.status_and_code().0, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
