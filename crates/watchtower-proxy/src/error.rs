//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A listener port is held by another socket.
    #[error("Port {0} is already in use. Stop the other process or choose a different port.")]
    PortInUse(u16),

    /// The OS refused the bind (privileged port, sandbox).
    #[error("Permission denied binding port {0}")]
    BindPermissionDenied(u16),

    /// Forward and reverse ports overlap.
    #[error("Port {0} is configured for more than one listener")]
    PortConflict(u16),

    /// A leaf certificate could not be issued.
    #[error("Certificate issuance failed for {host}: {reason}")]
    CertIssuanceFailed { host: String, reason: String },

    /// The upstream TLS handshake failed.
    #[error("Upstream TLS handshake with {host} failed: {reason}")]
    UpstreamTlsFailed { host: String, reason: String },

    /// The upstream could not be reached.
    #[error("Upstream {target} unreachable: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    /// The configured DNS server is not `ip` or `ip:port`.
    #[error("Invalid DNS server: {0}")]
    InvalidDnsServer(String),

    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] watchtower_storage::StorageError),
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
