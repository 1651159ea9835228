//! Proxy lifecycle.
//!
//! [`ProxySupervisor`] owns the listeners of one proxy run. Start and stop
//! are serialized; a start while running is a no-op that reports the
//! current status. Every transition is broadcast as a [`ProxyEvent`].

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use watchtower_core::{ProxySettings, ProxyStatus, DEFAULT_PROXY_PORT};

use crate::cert_cache::CertCache;
use crate::capture::TrafficRecorder;
use crate::dns::DnsOverride;
use crate::error::{ProxyError, Result};
use crate::handler::ProxyContext;
use crate::listener::{bind, spawn_accept_loop, ListenerKind};
use crate::state::SharedConfig;
use crate::upstream::Upstream;

/// How long in-flight connections may run after `stop`.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Extra time given to force-closed tasks to unwind.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 64;

/// Broadcast on every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ProxyEvent {
    StatusChanged(ProxyStatus),
    StartFailed(String),
}

struct RunningProxy {
    ctx: Arc<ProxyContext>,
    accept_loops: Vec<JoinHandle<()>>,
}

/// Owns the running listeners and their shared context.
pub struct ProxySupervisor {
    config: SharedConfig,
    certs: Arc<CertCache>,
    recorder: TrafficRecorder,
    upstream: Upstream,
    grace: Duration,
    events: broadcast::Sender<ProxyEvent>,
    running: Mutex<Option<RunningProxy>>,
    status: RwLock<ProxyStatus>,
}

impl ProxySupervisor {
    pub fn new(config: SharedConfig, certs: Arc<CertCache>, recorder: TrafficRecorder) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let status = ProxyStatus {
            running: false,
            port: DEFAULT_PROXY_PORT,
            reverse_http_port: None,
            reverse_https_port: None,
            local_routing_enabled: config.local_routing_enabled(),
        };

        Ok(Self {
            config,
            certs,
            recorder,
            upstream: Upstream::new()?,
            grace: DEFAULT_GRACE_PERIOD,
            events,
            running: Mutex::new(None),
            status: RwLock::new(status),
        })
    }

    /// Replaces the upstream connector (custom trust roots).
    pub fn with_upstream(mut self, upstream: Upstream) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn certs(&self) -> &Arc<CertCache> {
        &self.certs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Current status; the routing flag is read live.
    pub fn status(&self) -> ProxyStatus {
        let mut status = self.status.read().clone();
        status.local_routing_enabled = self.config.local_routing_enabled();
        status
    }

    pub fn is_running(&self) -> bool {
        self.status.read().running
    }

    /// Reflects configured ports in the status while stopped.
    pub fn apply_settings(&self, settings: &ProxySettings) {
        let mut status = self.status.write();
        if !status.running {
            status.port = settings.proxy_port;
            status.reverse_http_port = enabled_port(settings.reverse_http_port);
            status.reverse_https_port = enabled_port(settings.reverse_https_port);
        }
    }

    /// Binds every configured listener and starts accepting.
    pub async fn start(&self, settings: &ProxySettings) -> Result<ProxyStatus> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            info!("Proxy already running");
            return Ok(self.status());
        }

        match self.launch(settings).await {
            Ok((proxy, ports)) => {
                *running = Some(proxy);
                {
                    let mut status = self.status.write();
                    status.running = true;
                    status.port = ports.0;
                    status.reverse_http_port = ports.1;
                    status.reverse_https_port = ports.2;
                }
                let status = self.status();
                info!(
                    port = status.port,
                    reverse_http = ?status.reverse_http_port,
                    reverse_https = ?status.reverse_https_port,
                    "Proxy started"
                );
                self.broadcast(ProxyEvent::StatusChanged(status.clone()));
                Ok(status)
            }
            Err(e) => {
                error!("Proxy failed to start: {}", e);
                self.broadcast(ProxyEvent::StartFailed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        settings: &ProxySettings,
    ) -> Result<(RunningProxy, (u16, Option<u16>, Option<u16>))> {
        let reverse_http = enabled_port(settings.reverse_http_port);
        let reverse_https = enabled_port(settings.reverse_https_port);
        check_ports(settings.proxy_port, reverse_http, reverse_https)?;

        let dns = DnsOverride::from_setting(settings.dns_server.as_deref())?;
        let ip = if settings.bind_all {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };

        // Listeners bound so far are dropped, and their ports released,
        // if a later bind fails.
        let mut listeners = vec![(
            ListenerKind::Forward,
            bind(SocketAddr::new(ip, settings.proxy_port)).await?,
        )];
        if let Some(port) = reverse_http {
            listeners.push((
                ListenerKind::ReverseHttp,
                bind(SocketAddr::new(ip, port)).await?,
            ));
        }
        if let Some(port) = reverse_https {
            listeners.push((
                ListenerKind::ReverseHttps,
                bind(SocketAddr::new(ip, port)).await?,
            ));
        }

        let mut bound = (settings.proxy_port, None, None);
        for (kind, listener) in &listeners {
            let port = listener.local_addr()?.port();
            match kind {
                ListenerKind::Forward => bound.0 = port,
                ListenerKind::ReverseHttp => bound.1 = Some(port),
                ListenerKind::ReverseHttps => bound.2 = Some(port),
            }
        }

        let ctx = Arc::new(ProxyContext {
            config: self.config.clone(),
            certs: self.certs.clone(),
            dns,
            recorder: self.recorder.clone(),
            upstream: self.upstream.clone(),
            forward_port: bound.0,
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let accept_loops = listeners
            .into_iter()
            .map(|(kind, listener)| spawn_accept_loop(ctx.clone(), listener, kind))
            .collect();

        Ok((RunningProxy { ctx, accept_loops }, bound))
    }

    /// Stops accepting, drains in-flight connections for the grace period,
    /// then force-closes the rest.
    pub async fn stop(&self) -> ProxyStatus {
        let mut running = self.running.lock().await;
        let Some(proxy) = running.take() else {
            return self.status();
        };

        info!("Stopping proxy");
        proxy.ctx.shutdown.cancel();
        for handle in proxy.accept_loops {
            let _ = handle.await;
        }

        let tracker = &proxy.ctx.tracker;
        tracker.close();
        if tokio::time::timeout(self.grace, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                grace_ms = self.grace.as_millis() as u64,
                "Grace period elapsed, force-closing connections"
            );
            proxy.ctx.force.cancel();
            let _ = tokio::time::timeout(FORCE_CLOSE_WAIT, tracker.wait()).await;
        }

        self.status.write().running = false;
        let status = self.status();
        info!("Proxy stopped");
        self.broadcast(ProxyEvent::StatusChanged(status.clone()));
        status
    }

    /// Flips local routing for subsequent requests without a restart.
    pub fn set_local_routing_enabled(&self, enabled: bool) -> ProxyStatus {
        self.config.set_local_routing_enabled(enabled);
        let status = self.status();
        info!(enabled, "Local routing toggled");
        self.broadcast(ProxyEvent::StatusChanged(status.clone()));
        status
    }

    fn broadcast(&self, event: ProxyEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn enabled_port(port: Option<u16>) -> Option<u16> {
    port.filter(|&p| p > 0)
}

/// Forward and reverse ports must be pairwise distinct. Port 0 asks the OS
/// for a free port and never conflicts.
fn check_ports(forward: u16, reverse_http: Option<u16>, reverse_https: Option<u16>) -> Result<()> {
    let mut used = HashSet::new();
    for port in std::iter::once(forward).chain(reverse_http).chain(reverse_https) {
        if port != 0 && !used.insert(port) {
            return Err(ProxyError::PortConflict(port));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::time::Instant;

    use chrono::Utc;
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::header::{HeaderValue, HOST};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::TlsConnector;

    use watchtower_core::{ApiMock, CapturePolicy, ConfigSnapshot, LocalRoute, LogFilter, LogSource};
    use watchtower_storage::TrafficLogStore;

    use crate::ca::CaManager;
    use crate::tls::client_config_with_roots;

    struct Fixture {
        _dir: TempDir,
        store: TrafficLogStore,
        supervisor: ProxySupervisor,
    }

    fn fixture(snapshot: ConfigSnapshot) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = CaManager::new(dir.path().join("ca")).ensure_ca().unwrap();
        let store = TrafficLogStore::new(dir.path().join("api_logs")).unwrap();
        let (recorder, _) = TrafficRecorder::spawn(store.clone());
        let supervisor = ProxySupervisor::new(
            SharedConfig::new(snapshot),
            Arc::new(CertCache::new(root)),
            recorder,
        )
        .unwrap();

        Fixture {
            _dir: dir,
            store,
            supervisor,
        }
    }

    fn ephemeral() -> ProxySettings {
        ProxySettings {
            proxy_port: 0,
            ..Default::default()
        }
    }

    fn route(domain: &str, port: u16) -> LocalRoute {
        LocalRoute {
            id: 1,
            domain: domain.into(),
            target_host: "127.0.0.1".into(),
            target_port: port,
            enabled: true,
        }
    }

    fn routed(domain: &str, port: u16) -> ConfigSnapshot {
        ConfigSnapshot {
            local_routing_enabled: true,
            routes: vec![route(domain, port)],
            ..Default::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// HTTP server answering `"{name} {path}"` after `delay`.
    async fn spawn_origin(name: &'static str, delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| async move {
                        let host = req
                            .headers()
                            .get(HOST)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = format!("{} {}", name, req.uri().path());
                        tokio::time::sleep(delay).await;

                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        if let Ok(value) = HeaderValue::from_str(&host) {
                            response.headers_mut().insert("x-seen-host", value);
                        }
                        Ok::<_, Infallible>(response)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    async fn read_to_close<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn send_raw(port: u16, request: String) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), read_to_close(&mut stream))
            .await
            .unwrap_or_default()
    }

    fn get(url: &str, host: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            url, host
        )
    }

    /// Opens a CONNECT tunnel and returns the stream after the 200.
    async fn connect_tunnel(proxy_port: u16, authority: &str) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        stream
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority).as_bytes())
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "proxy closed during CONNECT");
            head.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&head);
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {}", head);
        stream
    }

    #[test]
    fn port_overlap_detection() {
        assert!(check_ports(8888, Some(8080), Some(8443)).is_ok());
        assert!(check_ports(0, Some(0), None).is_ok());
        assert!(matches!(
            check_ports(8888, Some(8888), None),
            Err(ProxyError::PortConflict(8888))
        ));
        assert!(matches!(
            check_ports(8888, Some(8080), Some(8080)),
            Err(ProxyError::PortConflict(8080))
        ));
    }

    #[tokio::test]
    async fn routes_locally_and_passes_through_when_disabled() {
        let local = spawn_origin("local", Duration::ZERO).await;
        let real = spawn_origin("real", Duration::ZERO).await;
        let fx = fixture(routed("localhost", local.port()));

        let status = fx.supervisor.start(&ephemeral()).await.unwrap();
        assert!(status.running);

        let authority = format!("localhost:{}", real.port());
        let url = format!("http://{}/hello", authority);

        let reply = send_raw(status.port, get(&url, &authority)).await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
        assert!(reply.contains("local /hello"));
        assert!(reply.contains(&format!("x-seen-host: {}", authority)));

        fx.supervisor.set_local_routing_enabled(false);
        let reply = send_raw(status.port, get(&url, &authority)).await;
        assert!(reply.contains("real /hello"), "{}", reply);

        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn mock_answers_without_network() {
        let fx = fixture(ConfigSnapshot {
            mocks: vec![ApiMock {
                id: "m1".into(),
                host: "offline.invalid".into(),
                path: "/health".into(),
                method: "GET".into(),
                status_code: 418,
                response_body: "teapot".into(),
                content_type: "text/plain".into(),
                enabled: true,
            }],
            ..Default::default()
        });
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let reply = send_raw(
            status.port,
            get("http://offline.invalid/health?check=1", "offline.invalid"),
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 418"), "{}", reply);
        assert!(reply.contains("content-type: text/plain"));
        assert!(reply.contains("x-watchtower-mock: 1"));
        assert!(reply.ends_with("teapot"));

        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn taken_port_reports_port_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let fx = fixture(ConfigSnapshot::default());
        let mut events = fx.supervisor.subscribe();

        let err = fx
            .supervisor
            .start(&ProxySettings {
                proxy_port: port,
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::PortInUse(p) if p == port));
        assert!(!fx.supervisor.status().running);
        assert!(matches!(events.try_recv(), Ok(ProxyEvent::StartFailed(_))));
    }

    #[tokio::test]
    async fn failed_reverse_bind_releases_forward_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let forward = free_port();
        let fx = fixture(ConfigSnapshot::default());

        let err = fx
            .supervisor
            .start(&ProxySettings {
                proxy_port: forward,
                reverse_http_port: Some(taken_port),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PortInUse(p) if p == taken_port));

        // The forward port is free again
        std::net::TcpListener::bind(("127.0.0.1", forward)).unwrap();
    }

    #[tokio::test]
    async fn overlapping_ports_are_rejected_before_binding() {
        let fx = fixture(ConfigSnapshot::default());
        let err = fx
            .supervisor
            .start(&ProxySettings {
                proxy_port: 45123,
                reverse_https_port: Some(45123),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::PortConflict(45123)));
        assert!(!fx.supervisor.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_frees_port() {
        let fx = fixture(ConfigSnapshot::default());
        let mut events = fx.supervisor.subscribe();

        let first = fx.supervisor.start(&ephemeral()).await.unwrap();
        let second = fx.supervisor.start(&ephemeral()).await.unwrap();
        assert_eq!(first, second);

        match events.try_recv() {
            Ok(ProxyEvent::StatusChanged(status)) => assert!(status.running),
            other => panic!("unexpected event: {:?}", other),
        }

        let stopped = fx.supervisor.stop().await;
        assert!(!stopped.running);
        assert_eq!(stopped.port, first.port);
        std::net::TcpListener::bind(("127.0.0.1", first.port)).unwrap();

        // Stopping again is harmless
        assert!(!fx.supervisor.stop().await.running);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_requests_finish() {
        let slow = spawn_origin("slow", Duration::from_millis(300)).await;
        let fx = fixture(routed("slow.test", slow.port()));
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let request = tokio::spawn(send_raw(
            status.port,
            get("http://slow.test/work", "slow.test"),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        fx.supervisor.stop().await;
        let reply = request.await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
        assert!(reply.contains("slow /work"));
    }

    #[tokio::test]
    async fn stop_force_closes_after_grace_period() {
        let stuck = spawn_origin("stuck", Duration::from_secs(30)).await;
        let mut fx = fixture(routed("stuck.test", stuck.port()));
        fx.supervisor = fx.supervisor.with_grace_period(Duration::from_millis(200));
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let request = tokio::spawn(send_raw(
            status.port,
            get("http://stuck.test/", "stuck.test"),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        fx.supervisor.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3));

        let reply = tokio::time::timeout(Duration::from_secs(3), request)
            .await
            .expect("client connection was not closed")
            .unwrap();
        assert!(!reply.contains("200"));
    }

    #[tokio::test]
    async fn captured_exchange_is_persisted() {
        let origin = spawn_origin("api", Duration::ZERO).await;
        let mut capture = HashMap::new();
        capture.insert("localhost".to_string(), CapturePolicy { body_enabled: true });
        let fx = fixture(ConfigSnapshot {
            capture,
            ..Default::default()
        });
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let authority = format!("localhost:{}", origin.port());
        let request = format!(
            "POST http://{0}/items?draft=1 HTTP/1.1\r\nHost: {0}\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
            authority
        );
        let reply = send_raw(status.port, request).await;
        assert!(reply.contains("api /items"), "{}", reply);

        let date = TrafficLogStore::date_for(Utc::now().timestamp_millis());
        let mut entries = Vec::new();
        for _ in 0..100 {
            entries = fx.store.entries(&date, &LogFilter::default()).unwrap();
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.method, "POST");
        assert_eq!(entry.host, "localhost");
        assert_eq!(entry.path, "/items");
        assert_eq!(entry.url, format!("http://{}/items?draft=1", authority));
        assert_eq!(entry.status_code, 200);
        assert_eq!(entry.request_body.as_deref(), Some("hello"));
        assert_eq!(entry.response_body.as_deref(), Some("api /items"));
        assert_eq!(entry.source, LogSource::Proxy);

        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn connect_to_routed_host_is_decrypted() {
        let local = spawn_origin("local", Duration::ZERO).await;
        let fx = fixture(routed("secure.test", local.port()));
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let stream = connect_tunnel(status.port, "secure.test:443").await;

        let mut roots = RootCertStore::empty();
        roots
            .add(fx.supervisor.certs().root().cert_der().clone())
            .unwrap();
        let connector = TlsConnector::from(client_config_with_roots(roots).unwrap());
        let server_name = ServerName::try_from("secure.test".to_string()).unwrap();
        let mut tls = connector.connect(server_name, stream).await.unwrap();

        tls.write_all(get("/dashboard", "secure.test").as_bytes())
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(10), read_to_close(&mut tls))
            .await
            .unwrap();

        assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
        assert!(reply.contains("local /dashboard"));
        assert!(reply.contains("x-seen-host: secure.test"));
        assert_eq!(fx.supervisor.certs().generated_count(), 1);

        fx.supervisor.stop().await;
    }

    fn teapot_mock(host: &str) -> ApiMock {
        ApiMock {
            id: "m1".into(),
            host: host.into(),
            path: "/health".into(),
            method: "GET".into(),
            status_code: 418,
            response_body: "teapot".into(),
            content_type: "text/plain".into(),
            enabled: true,
        }
    }

    /// TLS client trusting only the proxy's root.
    fn trusting(supervisor: &ProxySupervisor) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(supervisor.certs().root().cert_der().clone()).unwrap();
        TlsConnector::from(client_config_with_roots(roots).unwrap())
    }

    #[tokio::test]
    async fn connect_to_mock_only_host_is_decrypted() {
        for routing in [false, true] {
            let fx = fixture(ConfigSnapshot {
                local_routing_enabled: routing,
                mocks: vec![teapot_mock("mocked.test")],
                ..Default::default()
            });
            let status = fx.supervisor.start(&ephemeral()).await.unwrap();

            let stream = connect_tunnel(status.port, "mocked.test:443").await;
            let server_name = ServerName::try_from("mocked.test".to_string()).unwrap();
            let mut tls = trusting(&fx.supervisor)
                .connect(server_name, stream)
                .await
                .unwrap();

            tls.write_all(get("/health", "mocked.test").as_bytes())
                .await
                .unwrap();
            let reply = tokio::time::timeout(Duration::from_secs(10), read_to_close(&mut tls))
                .await
                .unwrap();

            assert!(reply.starts_with("HTTP/1.1 418"), "routing={}: {}", routing, reply);
            assert!(reply.contains("x-watchtower-mock: 1"));
            assert!(reply.ends_with("teapot"));

            fx.supervisor.stop().await;
        }
    }

    #[tokio::test]
    async fn certificate_download_works_inside_tunnel() {
        let fx = fixture(routed("secure.test", free_port()));
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let stream = connect_tunnel(status.port, "secure.test:443").await;
        let server_name = ServerName::try_from("secure.test".to_string()).unwrap();
        let mut tls = trusting(&fx.supervisor)
            .connect(server_name, stream)
            .await
            .unwrap();

        tls.write_all(get("/.watchtower/cert/secure.test", "secure.test").as_bytes())
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(10), read_to_close(&mut tls))
            .await
            .unwrap();

        assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
        assert!(reply.contains("application/x-pem-file"));
        assert_eq!(reply.matches("BEGIN CERTIFICATE").count(), 2);

        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn loopback_alias_of_proxy_is_detected() {
        let fx = fixture(ConfigSnapshot::default());
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        // 127.1 names the proxy without matching its literal address
        let url = format!("http://127.1:{}/again", status.port);
        let reply = send_raw(status.port, get(&url, &format!("127.1:{}", status.port))).await;

        assert!(reply.starts_with("HTTP/1.1 508"), "{}", reply);

        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn custom_upstream_roots_reach_tls_origin() {
        let dir = TempDir::new().unwrap();
        let origin_ca = CaManager::new(dir.path().join("origin-ca")).ensure_ca().unwrap();
        let origin_roots = {
            let mut roots = RootCertStore::empty();
            roots.add(origin_ca.cert_der().clone()).unwrap();
            roots
        };
        let leaf = CertCache::new(origin_ca).leaf_for("localhost").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = listener.local_addr().unwrap().port();
        let acceptor = tokio_rustls::TlsAcceptor::from(leaf.server_config.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = format!("secure {}", req.uri().path());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        let url = format!("https://localhost:{}/secure", origin_port);
        let host = format!("localhost:{}", origin_port);

        let fx = fixture(ConfigSnapshot::default());
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();
        let untrusted = send_raw(status.port, get(&url, &host)).await;
        assert!(untrusted.starts_with("HTTP/1.1 502"), "{}", untrusted);
        fx.supervisor.stop().await;

        let root = CaManager::new(dir.path().join("ca")).ensure_ca().unwrap();
        let store = TrafficLogStore::new(dir.path().join("api_logs")).unwrap();
        let (recorder, _) = TrafficRecorder::spawn(store);
        let supervisor = ProxySupervisor::new(
            SharedConfig::new(ConfigSnapshot::default()),
            Arc::new(CertCache::new(root)),
            recorder,
        )
        .unwrap()
        .with_upstream(Upstream::with_roots(origin_roots).unwrap());
        let status = supervisor.start(&ephemeral()).await.unwrap();

        let trusted = send_raw(status.port, get(&url, &host)).await;
        assert!(trusted.starts_with("HTTP/1.1 200"), "{}", trusted);
        assert!(trusted.ends_with("secure /secure"));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn connect_to_other_host_is_an_opaque_tunnel() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = echo.accept().await {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            }
        });

        let fx = fixture(ConfigSnapshot::default());
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();

        let mut stream = connect_tunnel(status.port, &echo_addr.to_string()).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(fx.supervisor.certs().generated_count(), 0);

        drop(stream);
        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn serves_pac_and_certificates() {
        let fx = fixture(routed("app.test", 3000));
        let status = fx.supervisor.start(&ephemeral()).await.unwrap();
        let host = format!("127.0.0.1:{}", status.port);

        let pac = send_raw(status.port, get("/.watchtower/proxy.pac", &host)).await;
        assert!(pac.contains("application/x-ns-proxy-autoconfig"));
        assert!(pac.contains("\"app.test\""));
        assert!(pac.contains(&format!("PROXY 127.0.0.1:{}", status.port)));

        let root = send_raw(status.port, get("/.watchtower/cert", &host)).await;
        assert_eq!(root.matches("BEGIN CERTIFICATE").count(), 1);

        let leaf = send_raw(status.port, get("/.watchtower/cert/app.test", &host)).await;
        assert_eq!(leaf.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(!leaf.contains("PRIVATE KEY"));

        let setup = send_raw(status.port, get("/.watchtower/setup", &host)).await;
        assert!(setup.contains("text/html"));

        // Absolute-form requests to the proxy itself never loop
        let url = format!("http://127.0.0.1:{}/elsewhere", status.port);
        let own = send_raw(status.port, get(&url, &host)).await;
        assert!(own.starts_with("HTTP/1.1 404"), "{}", own);

        fx.supervisor.stop().await;
    }

    #[tokio::test]
    async fn reverse_http_listener_uses_host_header() {
        let local = spawn_origin("local", Duration::ZERO).await;
        let fx = fixture(routed("app.test", local.port()));
        let reverse = free_port();

        let status = fx
            .supervisor
            .start(&ProxySettings {
                proxy_port: 0,
                reverse_http_port: Some(reverse),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(status.reverse_http_port, Some(reverse));

        let reply = send_raw(reverse, get("/from-reverse", "app.test")).await;
        assert!(reply.contains("local /from-reverse"), "{}", reply);

        fx.supervisor.stop().await;
    }
}
