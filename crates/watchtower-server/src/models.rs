//! Command payloads and the response envelope.

use serde::{Deserialize, Serialize};

use watchtower_core::LogFilter;

/// Envelope returned by every successful command.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartProxyPayload {
    /// Overrides the persisted forward port for this run.
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct EnabledPayload {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdPayload {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct KeyPayload {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct RouteEnabledPayload {
    pub id: i64,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetProxyPortPayload {
    /// Clamped to 1-65535.
    pub port: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetReversePortsPayload {
    /// `0` or absent disables the listener.
    pub reverse_http_port: Option<u16>,
    pub reverse_https_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetDnsServerPayload {
    pub dns_server: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBindAllPayload {
    pub bind_all: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetCheckIntervalPayload {
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct DomainUrlPayload {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDomainPayload {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainIdPayload {
    pub domain_id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionalDomainIdPayload {
    pub domain_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSchemaPayload {
    pub domain_id: i64,
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSchemaPayload {
    pub domain_id: i64,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DiffSchemasPayload {
    pub id1: String,
    pub id2: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsPayload {
    pub date: String,
    #[serde(default)]
    pub filter: LogFilter,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClearLogsPayload {
    /// Absent clears every date.
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinLogPayload {
    pub date: String,
    pub log_id: String,
}

/// A mock as submitted before it has an id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApiMock {
    pub host: String,
    pub path: String,
    pub method: String,
    pub status_code: u16,
    #[serde(default)]
    pub response_body: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SaveRootCaPayload {
    pub path: String,
}
