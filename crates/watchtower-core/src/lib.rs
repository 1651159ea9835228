//! Watchtower Core - shared model and pure logic for the developer proxy.
//!
//! This crate holds everything the proxy engine decides without touching a
//! socket:
//!
//! - The persisted data model (routes, mocks, schemas, logging links, settings)
//! - Per-request dispatch over an immutable [`ConfigSnapshot`]
//! - Mock matching and "pin as mock" from captured traffic
//! - OpenAPI parsing, example synthesis and version diffing
//! - The HTTP client used for schema downloads and manual requests
//!
//! ## Dispatch
//!
//! ```text
//! host + path + method
//!         │
//!         ▼
//!   resolve_mock ──── hit ───► Disposition::Mock
//!         │ miss
//!         ▼
//!   resolve_route ─── hit ───► Disposition::Route (local routing enabled only)
//!         │ miss
//!         ▼
//!   Disposition::PassThrough
//! ```

pub mod dispatch;
pub mod error;
pub mod host;
pub mod http_client;
pub mod ids;
pub mod mock;
pub mod models;
pub mod openapi;

pub use dispatch::{CapturePolicy, ConfigSnapshot, Disposition, RouteTarget};
pub use error::{CoreError, Result};
pub use http_client::ApiClient;
pub use models::{
    ApiLogEntry, ApiMock, ApiRequest, ApiRequestResult, ApiSchema, ApiTestCase, Domain,
    DomainApiLoggingLink, LocalRoute, LocalRouteUpdate, LogFilter, LogSource, NewApiTestCase,
    NewLocalRoute, ProxySettings, ProxyStatus, SchemaDownloadResult, SchemaSource, TestCaseResult,
};

/// Default forward proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8888;

/// Default background check interval in seconds.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 120;
