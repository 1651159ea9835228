//! API route handlers.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use watchtower_core::{
    ApiMock, ApiRequest, DomainApiLoggingLink, LocalRouteUpdate, NewApiTestCase, NewLocalRoute,
};

use crate::engine::Engine;
use crate::error::{ApiError, Result};
use crate::models::{
    ApiResponse, ClearLogsPayload, DiffSchemasPayload, DomainIdPayload, DomainUrlPayload,
    DownloadSchemaPayload, EnabledPayload, IdPayload, ImportSchemaPayload, KeyPayload, LogsPayload,
    NewApiMock, OptionalDomainIdPayload, PinLogPayload, RouteEnabledPayload, SaveRootCaPayload,
    SetBindAllPayload, SetCheckIntervalPayload, SetDnsServerPayload, SetProxyPortPayload,
    SetReversePortsPayload, StartProxyPayload, UpdateDomainPayload,
};

/// Every command accepted by `POST /api/commands/{name}`.
pub const COMMANDS: &[&str] = &[
    "get_proxy_status",
    "start_local_proxy",
    "stop_local_proxy",
    "set_local_routing_enabled",
    "get_proxy_auto_start_error",
    "get_proxy_setup_url",
    "get_local_routes",
    "add_local_route",
    "update_local_route",
    "remove_local_route",
    "set_local_route_enabled",
    "get_proxy_settings",
    "set_proxy_port",
    "set_proxy_reverse_ports",
    "set_proxy_dns_server",
    "set_proxy_bind_all",
    "set_proxy_check_interval",
    "get_domains",
    "add_domain",
    "update_domain",
    "remove_domain",
    "get_domain_api_logging_links",
    "set_domain_api_logging",
    "remove_domain_api_logging",
    "download_api_schema",
    "import_api_schema",
    "get_api_schema_content",
    "get_api_schema_by_id",
    "get_api_schemas",
    "remove_api_schema",
    "parse_api_schema",
    "diff_api_schemas",
    "list_api_log_dates",
    "get_api_logs",
    "clear_api_logs",
    "get_api_mocks",
    "add_api_mock",
    "update_api_mock",
    "remove_api_mock",
    "pin_api_log_as_mock",
    "send_api_request",
    "get_api_test_cases",
    "add_api_test_case",
    "remove_api_test_case",
    "run_api_test_cases",
    "get_root_ca_pem",
    "save_root_ca",
];

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// GET /api/commands - List command names.
pub async fn list_commands() -> Json<ApiResponse<&'static [&'static str]>> {
    Json(ApiResponse::ok("OK", COMMANDS))
}

/// POST /api/commands/{name} - Run one command with a JSON payload.
pub async fn run_command(
    State(engine): State<Engine>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON payload: {}", e)))?
    };

    debug!(command = %name, "Running command");
    dispatch(&engine, &name, payload).await
}

async fn dispatch(engine: &Engine, name: &str, payload: Value) -> Result<Response> {
    match name {
        // Proxy lifecycle
        "get_proxy_status" => {
            let status = engine.get_proxy_status();
            let message = if status.running { "Proxy running" } else { "Proxy stopped" };
            ok(message, status)
        }
        "start_local_proxy" => {
            let p: StartProxyPayload = optional_args(payload)?;
            let status = engine.start_local_proxy(p.port).await?;
            ok(format!("Proxy started on port {}", status.port), status)
        }
        "stop_local_proxy" => ok("Proxy stopped", engine.stop_local_proxy().await),
        "set_local_routing_enabled" => {
            let p: EnabledPayload = args(payload)?;
            let message = if p.enabled { "Local routing enabled" } else { "Local routing disabled" };
            ok(message, engine.set_local_routing_enabled(p.enabled)?)
        }
        "get_proxy_auto_start_error" => {
            let err = engine.get_proxy_auto_start_error();
            let message = if err.is_some() { "Auto-start failed" } else { "OK" };
            ok(message, err)
        }
        "get_proxy_setup_url" => ok("OK", engine.get_proxy_setup_url()?),

        // Local routes
        "get_local_routes" => ok("OK", engine.get_local_routes()?),
        "add_local_route" => ok("Route added", engine.add_local_route(args::<NewLocalRoute>(payload)?)?),
        "update_local_route" => {
            ok("Route updated", engine.update_local_route(args::<LocalRouteUpdate>(payload)?)?)
        }
        "remove_local_route" => {
            let p: IdPayload = args(payload)?;
            ok("Route removed", engine.remove_local_route(p.id)?)
        }
        "set_local_route_enabled" => {
            let p: RouteEnabledPayload = args(payload)?;
            ok("Route updated", engine.set_local_route_enabled(p.id, p.enabled)?)
        }

        // Settings
        "get_proxy_settings" => ok("OK", engine.get_proxy_settings()?),
        "set_proxy_port" => {
            let p: SetProxyPortPayload = args(payload)?;
            let settings = engine.set_proxy_port(p.port)?;
            ok(
                format!("Proxy port set to {} (apply on next proxy start)", settings.proxy_port),
                settings,
            )
        }
        "set_proxy_reverse_ports" => {
            let p: SetReversePortsPayload = optional_args(payload)?;
            ok(
                "Reverse ports updated (apply on next proxy start)",
                engine.set_proxy_reverse_ports(p.reverse_http_port, p.reverse_https_port)?,
            )
        }
        "set_proxy_dns_server" => {
            let p: SetDnsServerPayload = optional_args(payload)?;
            ok("DNS server updated", engine.set_proxy_dns_server(p.dns_server)?)
        }
        "set_proxy_bind_all" => {
            let p: SetBindAllPayload = args(payload)?;
            ok("Bind address updated", engine.set_proxy_bind_all(p.bind_all)?)
        }
        "set_proxy_check_interval" => {
            let p: SetCheckIntervalPayload = args(payload)?;
            let settings = engine.set_proxy_check_interval(p.interval)?;
            ok(
                format!("Check interval updated to {}s", settings.check_interval_secs),
                settings,
            )
        }

        // Domains
        "get_domains" => ok("OK", engine.get_domains()?),
        "add_domain" => {
            let p: DomainUrlPayload = args(payload)?;
            ok("Domain added", engine.add_domain(&p.url)?)
        }
        "update_domain" => {
            let p: UpdateDomainPayload = args(payload)?;
            ok("Domain updated", engine.update_domain(p.id, &p.url)?)
        }
        "remove_domain" => {
            let p: IdPayload = args(payload)?;
            engine.remove_domain(p.id)?;
            ok("Domain removed", p.id)
        }

        // Logging links
        "get_domain_api_logging_links" => ok("OK", engine.get_domain_api_logging_links()?),
        "set_domain_api_logging" => ok(
            "API logging updated",
            engine.set_domain_api_logging(args::<DomainApiLoggingLink>(payload)?)?,
        ),
        "remove_domain_api_logging" => {
            let p: DomainIdPayload = args(payload)?;
            engine.remove_domain_api_logging(p.domain_id)?;
            ok("API logging removed", p.domain_id)
        }

        // Schemas
        "download_api_schema" => {
            let p: DownloadSchemaPayload = args(payload)?;
            ok("Schema downloaded", engine.download_api_schema(p.domain_id, &p.url).await?)
        }
        "import_api_schema" => {
            let p: ImportSchemaPayload = args(payload)?;
            ok("Schema imported", engine.import_api_schema(p.domain_id, p.content)?)
        }
        "get_api_schema_content" => {
            let p: DomainIdPayload = args(payload)?;
            ok("OK", engine.get_api_schema_content(p.domain_id)?)
        }
        "get_api_schema_by_id" => {
            let p: KeyPayload = args(payload)?;
            ok("OK", engine.get_api_schema_by_id(&p.id)?)
        }
        "get_api_schemas" => {
            let p: DomainIdPayload = args(payload)?;
            ok("OK", engine.get_api_schemas(p.domain_id)?)
        }
        "remove_api_schema" => {
            let p: KeyPayload = args(payload)?;
            engine.remove_api_schema(&p.id)?;
            ok("Schema removed", p.id)
        }
        "parse_api_schema" => {
            let p: KeyPayload = args(payload)?;
            ok("OK", engine.parse_api_schema(&p.id)?)
        }
        "diff_api_schemas" => {
            let p: DiffSchemasPayload = args(payload)?;
            ok("OK", engine.diff_api_schemas(&p.id1, &p.id2)?)
        }

        // Traffic logs
        "list_api_log_dates" => ok("OK", engine.list_api_log_dates()?),
        "get_api_logs" => {
            let p: LogsPayload = args(payload)?;
            ok("OK", engine.get_api_logs(&p.date, &p.filter)?)
        }
        "clear_api_logs" => {
            let p: ClearLogsPayload = optional_args(payload)?;
            ok("Logs cleared", engine.clear_api_logs(p.date.as_deref())?)
        }

        // Mocks
        "get_api_mocks" => ok("OK", engine.get_api_mocks()?),
        "add_api_mock" => ok("Mock added", engine.add_api_mock(args::<NewApiMock>(payload)?)?),
        "update_api_mock" => ok("Mock updated", engine.update_api_mock(args::<ApiMock>(payload)?)?),
        "remove_api_mock" => {
            let p: KeyPayload = args(payload)?;
            engine.remove_api_mock(&p.id)?;
            ok("Mock removed", p.id)
        }
        "pin_api_log_as_mock" => {
            let p: PinLogPayload = args(payload)?;
            ok("Pinned as mock", engine.pin_api_log_as_mock(&p.date, &p.log_id)?)
        }

        // Requests and test cases
        "send_api_request" => {
            let request: ApiRequest = args(payload)?;
            ok("OK", engine.send_api_request(request).await?)
        }
        "get_api_test_cases" => {
            let p: OptionalDomainIdPayload = optional_args(payload)?;
            ok("OK", engine.get_api_test_cases(p.domain_id)?)
        }
        "add_api_test_case" => {
            ok("Test case added", engine.add_api_test_case(args::<NewApiTestCase>(payload)?)?)
        }
        "remove_api_test_case" => {
            let p: KeyPayload = args(payload)?;
            engine.remove_api_test_case(&p.id)?;
            ok("Test case removed", p.id)
        }
        "run_api_test_cases" => {
            let p: DomainIdPayload = args(payload)?;
            ok("OK", engine.run_api_test_cases(p.domain_id).await?)
        }

        // Root CA
        "get_root_ca_pem" => ok("OK", engine.get_root_ca_pem()),
        "save_root_ca" => {
            let p: SaveRootCaPayload = args(payload)?;
            let path = engine.save_root_ca(p.path)?;
            ok("Root CA saved", path.display().to_string())
        }

        other => Err(ApiError::NotFound(format!("unknown command: {}", other))),
    }
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Result<Response> {
    Ok(Json(ApiResponse::ok(message, data)).into_response())
}

fn args<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| ApiError::BadRequest(format!("invalid payload: {}", e)))
}

/// Like [`args`], but a missing payload means all defaults.
fn optional_args<T: DeserializeOwned + Default>(payload: Value) -> Result<T> {
    if payload.is_null() {
        return Ok(T::default());
    }
    args(payload)
}

/// GET /api/events - Proxy lifecycle events as server-sent events.
pub async fn events(
    State(engine): State<Engine>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = engine.subscribe();

    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event("proxy").data(data)), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
