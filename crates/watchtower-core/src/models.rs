//! Data model shared by storage, the proxy engine and the command surface.
//!
//! All records serialize in camelCase, which is the shape the desktop
//! frontend consumes.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_PROXY_PORT};

/// Prefix marking a body that was not valid UTF-8.
pub const BINARY_BODY_PREFIX: &str = "base64:";

/// A registered site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    /// Unique identifier.
    pub id: i64,
    /// Fully-qualified origin, e.g. `https://app.example.com`.
    pub url: String,
}

/// Redirects one host to a local development server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRoute {
    pub id: i64,
    /// Host the route applies to.
    pub domain: String,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
}

/// Parameters for creating a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLocalRoute {
    pub domain: String,
    pub target_host: String,
    pub target_port: u16,
}

/// Partial route update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRouteUpdate {
    pub id: i64,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub target_host: Option<String>,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Process-wide proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// DNS server for pass-through resolution (`ip` or `ip:port`).
    pub dns_server: Option<String>,
    /// Forward proxy port.
    pub proxy_port: u16,
    pub reverse_http_port: Option<u16>,
    pub reverse_https_port: Option<u16>,
    pub local_routing_enabled: bool,
    /// Bind on all interfaces instead of loopback.
    pub bind_all: bool,
    pub check_interval_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            dns_server: None,
            proxy_port: DEFAULT_PROXY_PORT,
            reverse_http_port: None,
            reverse_https_port: None,
            local_routing_enabled: true,
            bind_all: false,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
        }
    }
}

/// Runtime status broadcast on every state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
    pub reverse_http_port: Option<u16>,
    pub reverse_https_port: Option<u16>,
    pub local_routing_enabled: bool,
}

/// Where a captured entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Observed on a proxy listener.
    Proxy,
    /// Issued by the manual request runner.
    Test,
}

/// One captured request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLogEntry {
    pub id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub status_code: u16,
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_body: Option<String>,
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_body: Option<String>,
    pub source: LogSource,
    pub elapsed_ms: u64,
}

/// Filter applied when reading one day of captured traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    /// Matched against the path (exact) or the full URL (substring).
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub exact_match: bool,
}

impl LogFilter {
    /// Returns true when the entry passes every configured criterion.
    pub fn matches(&self, entry: &ApiLogEntry) -> bool {
        if let Some(method) = non_blank(&self.method) {
            if !entry.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }

        if let Some(host) = non_blank(&self.host) {
            let ok = if self.exact_match {
                entry.host.eq_ignore_ascii_case(host)
            } else {
                contains_ignore_case(&entry.host, host)
            };
            if !ok {
                return false;
            }
        }

        if let Some(text) = non_blank(&self.text) {
            let ok = if self.exact_match {
                entry.path == text
            } else {
                contains_ignore_case(&entry.url, text)
            };
            if !ok {
                return false;
            }
        }

        true
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Canned response served instead of contacting the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMock {
    #[serde(default)]
    pub id: String,
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

/// How a schema version entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaSource {
    Import,
    Url,
}

impl SchemaSource {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaSource::Import => "import",
            SchemaSource::Url => "url",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(SchemaSource::Import),
            "url" => Some(SchemaSource::Url),
            _ => None,
        }
    }
}

/// One stored version of a domain's API document. Never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSchema {
    pub id: String,
    pub domain_id: i64,
    pub version: String,
    /// Raw document text exactly as received.
    pub spec: String,
    pub source: SchemaSource,
    /// Unix milliseconds.
    pub fetched_at: i64,
}

/// Result of `download_api_schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDownloadResult {
    pub domain_id: i64,
    pub schema_id: String,
    pub version: String,
    pub size_bytes: usize,
    pub preview: String,
}

/// Per-domain capture opt-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainApiLoggingLink {
    pub domain_id: i64,
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
    /// Persist bodies as well as headers.
    #[serde(default)]
    pub body_enabled: bool,
    /// OpenAPI document location; its host is captured too.
    #[serde(default)]
    pub schema_url: Option<String>,
}

/// Request executed by the manual request runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response observed by the manual request runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequestResult {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed_ms: u64,
}

/// Saved regression request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTestCase {
    pub id: String,
    pub domain_id: i64,
    pub name: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Any 2xx passes when absent.
    #[serde(default)]
    pub expected_status: Option<u16>,
}

/// Parameters for creating a test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApiTestCase {
    pub domain_id: i64,
    pub name: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub expected_status: Option<u16>,
}

impl ApiTestCase {
    /// Builds the request this case sends.
    pub fn to_request(&self) -> ApiRequest {
        ApiRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Whether an observed status satisfies this case.
    pub fn accepts(&self, status: u16) -> bool {
        match self.expected_status {
            Some(expected) => expected == status,
            None => (200..300).contains(&status),
        }
    }
}

/// Outcome of one regression run entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub case_id: String,
    pub name: String,
    pub passed: bool,
    pub status_code: Option<u16>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Renders a captured body as text, base64-tagging non-UTF-8 payloads.
pub fn body_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("{}{}", BINARY_BODY_PREFIX, STANDARD.encode(bytes)),
    }
}
