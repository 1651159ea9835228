//! Watchtower Server - command API over the proxy engine.
//!
//! Front ends drive the engine through named commands. Each command takes a
//! JSON payload and answers with an `ApiResponse` envelope
//! (`{"success": true, "message": ..., "data": ...}`); failures answer with
//! `{"success": false, "error": ..., "code": ...}` and a matching status.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Liveness check
//! - `GET /api/commands` - Names of all commands
//! - `POST /api/commands/{name}` - Run a command
//! - `GET /api/events` - Proxy status events (server-sent events)
//!
//! ## Example
//!
//! ```no_run
//! use watchtower_server::{Engine, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::open("/tmp/watchtower").unwrap();
//!     let server = Server::new(ServerConfig::default(), engine).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod engine;
pub mod error;
mod handlers;
pub mod models;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use engine::Engine;
pub use error::{ApiError, Result};
pub use handlers::COMMANDS;
pub use models::ApiResponse;

/// Default command API port.
pub const DEFAULT_PORT: u16 = 48888;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 48888).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the command router over an engine.
pub fn router(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/commands", get(handlers::list_commands))
        .route("/api/commands/{name}", post(handlers::run_command))
        .route("/api/events", get(handlers::events))
        .layer(cors)
        .with_state(engine)
}

/// The command API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server for the given engine.
    pub fn new(config: ServerConfig, engine: Engine) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(engine),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<(), ServerError> {
        let listener = bind_reusable(self.addr)?;
        info!("Command API listening on {}", self.addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Binds with `SO_REUSEADDR` so a restart does not trip over `TIME_WAIT`.
fn bind_reusable(addr: SocketAddr) -> std::result::Result<tokio::net::TcpListener, ServerError> {
    let bind_err = |e| ServerError::BindError(addr, e);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).map_err(bind_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn create_test_app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        (dir, router(engine))
    }

    async fn command(app: &Router, name: &str, payload: Option<Value>) -> (StatusCode, Value) {
        let body = payload.map(|p| p.to_string()).unwrap_or_default();
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/commands/{}", name))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = create_test_app();
        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_without_payload() {
        let (_dir, app) = create_test_app();
        let (status, json) = command(&app, "get_proxy_status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["running"], false);
        assert_eq!(json["data"]["localRoutingEnabled"], true);
    }

    #[tokio::test]
    async fn test_route_round_trip() {
        let (_dir, app) = create_test_app();
        let (status, json) = command(
            &app,
            "add_local_route",
            Some(json!({"domain": "app.test", "targetHost": "127.0.0.1", "targetPort": 5173})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = json["data"]["id"].as_i64().unwrap();

        let (_, json) = command(
            &app,
            "set_local_route_enabled",
            Some(json!({"id": id, "enabled": false})),
        )
        .await;
        assert_eq!(json["data"]["enabled"], false);

        let (_, json) = command(&app, "get_local_routes", None).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (_dir, app) = create_test_app();
        let (status, json) = command(&app, "format_disk", None).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn test_missing_arguments() {
        let (_dir, app) = create_test_app();
        let (status, json) = command(&app, "remove_local_route", None).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_invalid_dns_server() {
        let (_dir, app) = create_test_app();
        let (status, json) = command(
            &app,
            "set_proxy_dns_server",
            Some(json!({"dnsServer": "dns.example"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_dns_server");
    }

    #[tokio::test]
    async fn test_invalid_schema_import() {
        let (_dir, app) = create_test_app();
        let (_, json) = command(&app, "add_domain", Some(json!({"url": "https://api.test"}))).await;
        let domain_id = json["data"]["id"].as_i64().unwrap();

        let (status, json) = command(
            &app,
            "import_api_schema",
            Some(json!({"domainId": domain_id, "content": "{\"paths\": {}}"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["code"], "invalid_schema");

        let (_, json) = command(&app, "get_api_schemas", Some(json!({"domainId": domain_id}))).await;
        assert!(json["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lists_commands() {
        let (_dir, app) = create_test_app();
        let request = Request::builder()
            .uri("/api/commands")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        let names = json["data"].as_array().unwrap();
        assert_eq!(names.len(), COMMANDS.len());
        assert!(names.iter().any(|n| n == "pin_api_log_as_mock"));
    }
}
