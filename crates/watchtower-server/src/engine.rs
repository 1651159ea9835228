//! The command surface.
//!
//! [`Engine`] is the handle a front end holds. Every command reads or writes
//! storage and, when routing inputs change, refreshes the proxy's shared
//! snapshot so the next request sees the edit. Setting commands only
//! persist; new ports apply on the next start.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::Uri;
use chrono::{Local, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use watchtower_core::host::{host_from_url, normalize_host};
use watchtower_core::ids::{new_id, schema_id};
use watchtower_core::mock::mock_from_log;
use watchtower_core::openapi::{
    diff_schemas, document_version, load_document, parse_spec, preview, ApiSchemaDiff,
    ParsedSchema,
};
use watchtower_core::{
    ApiClient, ApiLogEntry, ApiMock, ApiRequest, ApiRequestResult, ApiSchema, ApiTestCase, Domain,
    DomainApiLoggingLink, LocalRoute, LocalRouteUpdate, LogFilter, LogSource, NewApiTestCase,
    NewLocalRoute, ProxySettings, ProxyStatus, SchemaDownloadResult, SchemaSource, TestCaseResult,
};
use watchtower_proxy::{
    captured_body, parse_dns_server, CaManager, CertCache, ProxyEvent, ProxySupervisor,
    SharedConfig, TrafficRecorder,
};
use watchtower_storage::{Database, TrafficLogStore, DB_FILE_NAME};

use crate::error::{ApiError, Result};
use crate::models::NewApiMock;

/// Traffic log directory inside the data directory.
pub const API_LOG_DIR: &str = "api_logs";

/// Root CA directory inside the data directory.
pub const CA_DIR: &str = "ca";

/// Characters of a downloaded document echoed back as a preview.
const PREVIEW_CHARS: usize = 500;

/// Owned handle over storage, the CA and the proxy supervisor.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    logs: TrafficLogStore,
    ca: CaManager,
    proxy: Arc<ProxySupervisor>,
    recorder: TrafficRecorder,
    client: ApiClient,
    auto_start_error: Arc<RwLock<Option<String>>>,
}

impl Engine {
    /// Opens every store under `data_dir`. Must run inside a Tokio runtime.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let db = Database::with_path(data_dir.join(DB_FILE_NAME))?;
        let logs = TrafficLogStore::new(data_dir.join(API_LOG_DIR))?;
        let ca = CaManager::new(data_dir.join(CA_DIR));
        Self::from_parts(db, logs, ca)
    }

    /// Builds an engine from already opened stores.
    pub fn from_parts(db: Database, logs: TrafficLogStore, ca: CaManager) -> Result<Self> {
        let root = ca.ensure_ca()?;
        let config = SharedConfig::load(&db)?;
        let certs = Arc::new(CertCache::new(root));
        let (recorder, _writer) = TrafficRecorder::spawn(logs.clone());

        let proxy = ProxySupervisor::new(config, certs, recorder.clone())?;
        proxy.apply_settings(&db.get_proxy_settings()?);

        Ok(Self {
            db,
            logs,
            ca,
            proxy: Arc::new(proxy),
            recorder,
            client: ApiClient::new()?,
            auto_start_error: Arc::new(RwLock::new(None)),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn traffic_logs(&self) -> &TrafficLogStore {
        &self.logs
    }

    pub fn supervisor(&self) -> &Arc<ProxySupervisor> {
        &self.proxy
    }

    /// Lifecycle events of the proxy.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.proxy.subscribe()
    }

    fn reload(&self) -> Result<()> {
        self.proxy.config().reload(&self.db)?;
        Ok(())
    }

    pub fn get_proxy_status(&self) -> ProxyStatus {
        self.proxy.status()
    }

    pub async fn start_local_proxy(&self, port: Option<u16>) -> Result<ProxyStatus> {
        let mut settings = self.db.get_proxy_settings()?;
        if let Some(port) = port {
            settings.proxy_port = port;
        }

        self.reload()?;
        let status = self.proxy.start(&settings).await?;
        *self.auto_start_error.write() = None;
        Ok(status)
    }

    pub async fn stop_local_proxy(&self) -> ProxyStatus {
        self.proxy.stop().await
    }

    /// Starts from persisted settings, keeping any failure for later queries.
    pub async fn auto_start(&self) -> Option<ProxyStatus> {
        let settings = match self.db.get_proxy_settings() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Auto-start skipped, settings unreadable: {}", e);
                *self.auto_start_error.write() = Some(e.to_string());
                return None;
            }
        };

        self.proxy
            .config()
            .set_local_routing_enabled(settings.local_routing_enabled);

        match self.proxy.start(&settings).await {
            Ok(status) => {
                *self.auto_start_error.write() = None;
                Some(status)
            }
            Err(e) => {
                warn!(port = settings.proxy_port, "Proxy auto-start failed: {}", e);
                *self.auto_start_error.write() = Some(e.to_string());
                None
            }
        }
    }

    pub fn get_proxy_auto_start_error(&self) -> Option<String> {
        self.auto_start_error.read().clone()
    }

    pub fn set_local_routing_enabled(&self, enabled: bool) -> Result<ProxyStatus> {
        let mut settings = self.db.get_proxy_settings()?;
        settings.local_routing_enabled = enabled;
        self.db.save_proxy_settings(&settings)?;
        Ok(self.proxy.set_local_routing_enabled(enabled))
    }

    /// URL of the device setup page on the running proxy.
    pub fn get_proxy_setup_url(&self) -> Result<String> {
        let status = self.proxy.status();
        if !status.running {
            return Err(ApiError::Conflict("Proxy is not running".into()));
        }

        let settings = self.db.get_proxy_settings()?;
        let host = if settings.bind_all {
            lan_address().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        let url = match (status.reverse_http_port, status.reverse_https_port) {
            (Some(port), _) => format!("http://{}:{}/.watchtower/setup", host, port),
            (None, Some(port)) => format!("https://{}:{}/.watchtower/setup", host, port),
            (None, None) => format!("http://{}:{}/.watchtower/setup", host, status.port),
        };
        Ok(url)
    }

    pub fn get_local_routes(&self) -> Result<Vec<LocalRoute>> {
        Ok(self.db.get_local_routes()?)
    }

    pub fn add_local_route(&self, route: NewLocalRoute) -> Result<LocalRoute> {
        let route = NewLocalRoute {
            domain: validated_host(&route.domain, "domain")?,
            target_host: validated_host(&route.target_host, "target host")?,
            target_port: validated_port(route.target_port)?,
        };

        let created = self.db.add_local_route(&route)?;
        self.reload()?;
        info!(domain = %created.domain, target = %format!("{}:{}", created.target_host, created.target_port), "Local route added");
        Ok(created)
    }

    pub fn update_local_route(&self, mut update: LocalRouteUpdate) -> Result<LocalRoute> {
        if let Some(domain) = &update.domain {
            update.domain = Some(validated_host(domain, "domain")?);
        }
        if let Some(target) = &update.target_host {
            update.target_host = Some(validated_host(target, "target host")?);
        }
        if let Some(port) = update.target_port {
            validated_port(port)?;
        }

        let route = self
            .db
            .update_local_route(&update)?
            .ok_or_else(|| ApiError::NotFound(format!("local route {}", update.id)))?;
        self.reload()?;
        Ok(route)
    }

    pub fn remove_local_route(&self, id: i64) -> Result<LocalRoute> {
        let route = self
            .db
            .remove_local_route(id)?
            .ok_or_else(|| ApiError::NotFound(format!("local route {}", id)))?;
        self.reload()?;
        Ok(route)
    }

    pub fn set_local_route_enabled(&self, id: i64, enabled: bool) -> Result<LocalRoute> {
        let route = self
            .db
            .set_local_route_enabled(id, enabled)?
            .ok_or_else(|| ApiError::NotFound(format!("local route {}", id)))?;
        self.reload()?;
        Ok(route)
    }

    pub fn get_proxy_settings(&self) -> Result<ProxySettings> {
        Ok(self.db.get_proxy_settings()?)
    }

    fn edit_settings(&self, edit: impl FnOnce(&mut ProxySettings)) -> Result<ProxySettings> {
        let mut settings = self.db.get_proxy_settings()?;
        edit(&mut settings);
        self.db.save_proxy_settings(&settings)?;
        self.proxy.apply_settings(&settings);
        Ok(settings)
    }

    pub fn set_proxy_port(&self, port: u32) -> Result<ProxySettings> {
        let port = port.clamp(1, u16::MAX as u32) as u16;
        self.edit_settings(|s| s.proxy_port = port)
    }

    pub fn set_proxy_reverse_ports(
        &self,
        reverse_http: Option<u16>,
        reverse_https: Option<u16>,
    ) -> Result<ProxySettings> {
        self.edit_settings(|s| {
            s.reverse_http_port = reverse_http.filter(|&p| p > 0);
            s.reverse_https_port = reverse_https.filter(|&p| p > 0);
        })
    }

    pub fn set_proxy_dns_server(&self, dns_server: Option<String>) -> Result<ProxySettings> {
        let dns_server = dns_server
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(value) = &dns_server {
            parse_dns_server(value)?;
        }
        self.edit_settings(|s| s.dns_server = dns_server)
    }

    pub fn set_proxy_bind_all(&self, bind_all: bool) -> Result<ProxySettings> {
        self.edit_settings(|s| s.bind_all = bind_all)
    }

    pub fn set_proxy_check_interval(&self, interval: u64) -> Result<ProxySettings> {
        self.edit_settings(|s| s.check_interval_secs = interval.max(1))
    }

    pub fn get_domains(&self) -> Result<Vec<Domain>> {
        Ok(self.db.get_domains()?)
    }

    pub fn add_domain(&self, url: &str) -> Result<Domain> {
        let url = validated_url(url)?;
        Ok(self.db.add_domain(&url)?)
    }

    pub fn update_domain(&self, id: i64, url: &str) -> Result<Domain> {
        let url = validated_url(url)?;
        let domain = self.db.update_domain(id, &url)?;
        self.reload()?;
        Ok(domain)
    }

    /// Removes a domain together with its logging link, schemas and test cases.
    pub fn remove_domain(&self, id: i64) -> Result<()> {
        if !self.db.remove_domain(id)? {
            return Err(ApiError::NotFound(format!("domain {}", id)));
        }
        self.reload()
    }

    pub fn get_domain_api_logging_links(&self) -> Result<Vec<DomainApiLoggingLink>> {
        Ok(self.db.get_logging_links()?)
    }

    pub fn set_domain_api_logging(&self, mut link: DomainApiLoggingLink) -> Result<DomainApiLoggingLink> {
        self.require_domain(link.domain_id)?;
        link.schema_url = link
            .schema_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());

        self.db.set_logging_link(&link)?;
        self.reload()?;
        debug!(domain_id = link.domain_id, logging = link.logging_enabled, bodies = link.body_enabled, "Logging link saved");
        Ok(link)
    }

    pub fn remove_domain_api_logging(&self, domain_id: i64) -> Result<()> {
        if !self.db.remove_logging_link(domain_id)? {
            return Err(ApiError::NotFound(format!("logging link for domain {}", domain_id)));
        }
        self.reload()
    }

    fn require_domain(&self, id: i64) -> Result<Domain> {
        self.db
            .get_domain(id)?
            .ok_or_else(|| ApiError::NotFound(format!("domain {}", id)))
    }

    /// Fetches and stores a new version. Nothing is stored on failure.
    pub async fn download_api_schema(&self, domain_id: i64, url: &str) -> Result<SchemaDownloadResult> {
        self.require_domain(domain_id)?;
        let fetched = self.client.fetch_document(url).await?;
        info!(domain_id, url = %fetched.url, bytes = fetched.text.len(), "Downloaded API schema");
        self.store_schema(domain_id, fetched.text, SchemaSource::Url)
    }

    pub fn import_api_schema(&self, domain_id: i64, content: String) -> Result<SchemaDownloadResult> {
        self.require_domain(domain_id)?;
        self.store_schema(domain_id, content, SchemaSource::Import)
    }

    fn store_schema(&self, domain_id: i64, spec: String, source: SchemaSource) -> Result<SchemaDownloadResult> {
        let doc = load_document(&spec)?;
        let version =
            document_version(&doc).unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string());

        let schema = ApiSchema {
            id: schema_id(domain_id),
            domain_id,
            version,
            spec,
            source,
            fetched_at: Utc::now().timestamp_millis(),
        };
        self.db.add_api_schema(&schema)?;

        Ok(SchemaDownloadResult {
            domain_id,
            schema_id: schema.id,
            version: schema.version,
            size_bytes: schema.spec.len(),
            preview: preview(&schema.spec, PREVIEW_CHARS),
        })
    }

    /// Raw text of the newest version for a domain.
    pub fn get_api_schema_content(&self, domain_id: i64) -> Result<Option<String>> {
        Ok(self.db.get_latest_api_schema(domain_id)?.map(|s| s.spec))
    }

    pub fn get_api_schema_by_id(&self, id: &str) -> Result<ApiSchema> {
        self.db
            .get_api_schema(id)?
            .ok_or_else(|| ApiError::NotFound(format!("schema {}", id)))
    }

    /// Versions of a domain, oldest first.
    pub fn get_api_schemas(&self, domain_id: i64) -> Result<Vec<ApiSchema>> {
        Ok(self.db.get_api_schemas(domain_id)?)
    }

    pub fn remove_api_schema(&self, id: &str) -> Result<()> {
        if !self.db.remove_api_schema(id)? {
            return Err(ApiError::NotFound(format!("schema {}", id)));
        }
        Ok(())
    }

    pub fn parse_api_schema(&self, id: &str) -> Result<ParsedSchema> {
        let schema = self.get_api_schema_by_id(id)?;
        Ok(parse_spec(&schema.spec)?)
    }

    pub fn diff_api_schemas(&self, id1: &str, id2: &str) -> Result<ApiSchemaDiff> {
        let old = self.parse_api_schema(id1)?;
        let new = self.parse_api_schema(id2)?;
        Ok(diff_schemas(id1, &old, id2, &new))
    }

    pub fn list_api_log_dates(&self) -> Result<Vec<String>> {
        Ok(self.logs.list_dates()?)
    }

    pub fn get_api_logs(&self, date: &str, filter: &LogFilter) -> Result<Vec<ApiLogEntry>> {
        Ok(self.logs.entries(date, filter)?)
    }

    /// Clears one date, or every date when `date` is `None`. Returns the
    /// number of days removed.
    pub fn clear_api_logs(&self, date: Option<&str>) -> Result<usize> {
        let removed = match date {
            Some(date) => usize::from(self.logs.clear(date)?),
            None => self.logs.clear_all()?,
        };
        info!(date = ?date, removed, "Cleared traffic logs");
        Ok(removed)
    }

    pub fn get_api_mocks(&self) -> Result<Vec<ApiMock>> {
        Ok(self.db.get_api_mocks()?)
    }

    pub fn add_api_mock(&self, mock: NewApiMock) -> Result<ApiMock> {
        let mock = validated_mock(ApiMock {
            id: new_id("mock"),
            host: mock.host,
            path: mock.path,
            method: mock.method,
            status_code: mock.status_code,
            response_body: mock.response_body,
            content_type: mock.content_type,
            enabled: mock.enabled,
        })?;

        self.db.add_api_mock(&mock)?;
        self.reload()?;
        Ok(mock)
    }

    pub fn update_api_mock(&self, mock: ApiMock) -> Result<ApiMock> {
        let mock = validated_mock(mock)?;
        if self.db.get_api_mock(&mock.id)?.is_none() {
            return Err(ApiError::NotFound(format!("mock {}", mock.id)));
        }

        self.db.update_api_mock(&mock)?;
        self.reload()?;
        Ok(mock)
    }

    pub fn remove_api_mock(&self, id: &str) -> Result<()> {
        if !self.db.remove_api_mock(id)? {
            return Err(ApiError::NotFound(format!("mock {}", id)));
        }
        self.reload()
    }

    /// Freezes a captured exchange as an enabled mock.
    pub fn pin_api_log_as_mock(&self, date: &str, log_id: &str) -> Result<ApiMock> {
        let entry = self
            .logs
            .find(date, log_id)?
            .ok_or_else(|| ApiError::NotFound(format!("log entry {} on {}", log_id, date)))?;

        let mock = mock_from_log(&entry);
        self.db.add_api_mock(&mock)?;
        self.reload()?;
        info!(host = %mock.host, path = %mock.path, method = %mock.method, "Pinned log entry as mock");
        Ok(mock)
    }

    /// Executes a request directly (not through the proxy) and captures it
    /// when its host has an enabled logging link.
    pub async fn send_api_request(&self, request: ApiRequest) -> Result<ApiRequestResult> {
        let result = self.client.send(&request).await?;
        self.capture_manual(&request, &result);
        Ok(result)
    }

    fn capture_manual(&self, request: &ApiRequest, result: &ApiRequestResult) {
        let Some(host) = host_from_url(&request.url) else {
            return;
        };
        let Some(policy) = self.proxy.config().snapshot().capture_policy(&host) else {
            return;
        };

        let url = request.url.trim().to_string();
        let path = url
            .parse::<Uri>()
            .map(|uri| uri.path().to_string())
            .unwrap_or_else(|_| "/".to_string());

        let (request_body, response_body) = if policy.body_enabled {
            (
                request.body.as_deref().and_then(|b| captured_body(b.as_bytes())),
                captured_body(result.body.as_bytes()),
            )
        } else {
            (None, None)
        };

        self.recorder.record(ApiLogEntry {
            id: new_id("log"),
            timestamp: Utc::now().timestamp_millis(),
            method: request.method.trim().to_ascii_uppercase(),
            url,
            host,
            path,
            status_code: result.status_code,
            request_headers: request.headers.clone(),
            request_body,
            response_headers: result.headers.clone(),
            response_body,
            source: LogSource::Test,
            elapsed_ms: result.elapsed_ms,
        });
    }

    pub fn get_api_test_cases(&self, domain_id: Option<i64>) -> Result<Vec<ApiTestCase>> {
        Ok(self.db.get_api_test_cases(domain_id)?)
    }

    pub fn add_api_test_case(&self, case: NewApiTestCase) -> Result<ApiTestCase> {
        self.require_domain(case.domain_id)?;
        if case.name.trim().is_empty() {
            return Err(ApiError::BadRequest("test case name is required".into()));
        }

        let case = ApiTestCase {
            id: new_id("test"),
            domain_id: case.domain_id,
            name: case.name.trim().to_string(),
            method: case.method.trim().to_ascii_uppercase(),
            url: case.url.trim().to_string(),
            headers: case.headers,
            body: case.body,
            expected_status: case.expected_status,
        };
        self.db.add_api_test_case(&case)?;
        Ok(case)
    }

    pub fn remove_api_test_case(&self, id: &str) -> Result<()> {
        if !self.db.remove_api_test_case(id)? {
            return Err(ApiError::NotFound(format!("test case {}", id)));
        }
        Ok(())
    }

    /// Runs a domain's cases in order; a transport failure fails that case only.
    pub async fn run_api_test_cases(&self, domain_id: i64) -> Result<Vec<TestCaseResult>> {
        let cases = self.db.get_api_test_cases(Some(domain_id))?;
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            let result = match self.send_api_request(case.to_request()).await {
                Ok(response) => TestCaseResult {
                    case_id: case.id.clone(),
                    name: case.name.clone(),
                    passed: case.accepts(response.status_code),
                    status_code: Some(response.status_code),
                    elapsed_ms: response.elapsed_ms,
                    error: None,
                },
                Err(e) => TestCaseResult {
                    case_id: case.id.clone(),
                    name: case.name.clone(),
                    passed: false,
                    status_code: None,
                    elapsed_ms: 0,
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }

        let passed = results.iter().filter(|r| r.passed).count();
        info!(domain_id, total = results.len(), passed, "Ran API test cases");
        Ok(results)
    }

    pub fn get_root_ca_pem(&self) -> String {
        self.proxy.certs().root().cert_pem().to_string()
    }

    /// Writes the root certificate (never the key) to `path`.
    pub fn save_root_ca(&self, path: impl Into<PathBuf>) -> Result<PathBuf> {
        let path = path.into();
        std::fs::write(&path, self.get_root_ca_pem())
            .map_err(|e| ApiError::Internal(format!("failed to write {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Saved root CA certificate");
        Ok(path)
    }

    /// Location of the root CA files on disk.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca.cert_path()
    }
}

fn validated_host(raw: &str, field: &str) -> Result<String> {
    let host = normalize_host(raw);
    if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
        return Err(ApiError::BadRequest(format!("invalid {}: {:?}", field, raw)));
    }
    Ok(host)
}

fn validated_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(ApiError::BadRequest("target port must be 1-65535".into()));
    }
    Ok(port)
}

fn validated_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    if host_from_url(url).is_none() {
        return Err(ApiError::BadRequest(format!("invalid domain URL: {:?}", raw)));
    }
    Ok(url.to_string())
}

fn validated_mock(mut mock: ApiMock) -> Result<ApiMock> {
    mock.host = validated_host(&mock.host, "mock host")?;

    let path = mock.path.trim();
    mock.path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    mock.method = mock.method.trim().to_ascii_uppercase();
    if mock.method.is_empty() {
        return Err(ApiError::BadRequest("mock method is required".into()));
    }
    if !(100..=599).contains(&mock.status_code) {
        return Err(ApiError::BadRequest(format!(
            "invalid status code {}",
            mock.status_code
        )));
    }
    Ok(mock)
}

/// Outbound interface address, found without sending anything.
fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
