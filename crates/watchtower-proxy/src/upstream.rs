//! Outbound leg: connecting to local targets and real upstreams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::body::ProxyBody;
use crate::dns::DnsOverride;
use crate::error::{ProxyError, Result};
use crate::tls::{client_config_with_roots, upstream_client_config};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Where a request leaves the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A local development server, always plaintext.
    Local { host: String, port: u16 },
    /// The real upstream, resolved through the DNS override.
    Origin { host: String, port: u16, tls: bool },
}

impl Destination {
    fn label(&self) -> String {
        match self {
            Destination::Local { host, port } | Destination::Origin { host, port, .. } => {
                format!("{}:{}", host, port)
            }
        }
    }
}

/// Opens upstream connections and sends one request over each.
#[derive(Clone)]
pub struct Upstream {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Upstream {
    /// Verifies upstream certificates against the web PKI.
    pub fn new() -> Result<Self> {
        Ok(Self::from_config(upstream_client_config()?))
    }

    /// Verifies upstream certificates against an explicit root set.
    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        Ok(Self::from_config(client_config_with_roots(roots)?))
    }

    fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(config),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Sends `req` to `dest` and returns the upstream response.
    pub async fn send(
        &self,
        dest: &Destination,
        req: Request<ProxyBody>,
        dns: &DnsOverride,
    ) -> Result<Response<ProxyBody>> {
        let req = to_origin_form(req);

        match dest {
            Destination::Local { host, port } => {
                let stream = self.connect_local(host, *port).await?;
                send_over(stream, req, dest).await
            }
            Destination::Origin { host, port, tls } => {
                let addrs = dns.resolve(host, *port).await.map_err(|e| {
                    ProxyError::UpstreamUnreachable {
                        target: dest.label(),
                        reason: e.to_string(),
                    }
                })?;
                let stream = self.connect_any(&addrs, dest).await?;

                if *tls {
                    let stream = self.handshake(host, stream).await?;
                    send_over(stream, req, dest).await
                } else {
                    send_over(stream, req, dest).await
                }
            }
        }
    }

    /// Opens a raw TCP connection for an opaque tunnel.
    pub async fn connect_tunnel(
        &self,
        host: &str,
        port: u16,
        dns: &DnsOverride,
    ) -> Result<TcpStream> {
        let dest = Destination::Origin {
            host: host.to_string(),
            port,
            tls: false,
        };
        let addrs = dns
            .resolve(host, port)
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable {
                target: dest.label(),
                reason: e.to_string(),
            })?;
        self.connect_any(&addrs, &dest).await
    }

    async fn connect_local(&self, host: &str, port: u16) -> Result<TcpStream> {
        let unreachable = |reason: String| ProxyError::UpstreamUnreachable {
            target: format!("{}:{}", host, port),
            reason,
        };

        tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| unreachable("connect timed out".to_string()))?
            .map_err(|e| unreachable(e.to_string()))
    }

    async fn connect_any(&self, addrs: &[SocketAddr], dest: &Destination) -> Result<TcpStream> {
        let mut last_error = String::from("no addresses");

        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            debug!(addr = %addr, "Upstream connect attempt failed: {}", last_error);
        }

        Err(ProxyError::UpstreamUnreachable {
            target: dest.label(),
            reason: last_error,
        })
    }

    async fn handshake(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tls_failed = |reason: String| ProxyError::UpstreamTlsFailed {
            host: host.to_string(),
            reason,
        };

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let server_name =
            ServerName::try_from(bare.to_string()).map_err(|e| tls_failed(e.to_string()))?;

        self.tls
            .connect(server_name, stream)
            .await
            .map_err(|e| tls_failed(e.to_string()))
    }
}

/// HTTP/1.1 exchange over an established stream.
async fn send_over<S>(
    stream: S,
    req: Request<ProxyBody>,
    dest: &Destination,
) -> Result<Response<ProxyBody>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

    let label = dest.label();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(target = %label, "Upstream connection closed: {}", e);
        }
    });

    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}

/// Rewrites an absolute-form request to origin-form, keeping `Host`.
fn to_origin_form(mut req: Request<ProxyBody>) -> Request<ProxyBody> {
    if let Some(authority) = req.uri().authority().cloned() {
        if !req.headers().contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if let Ok(uri) = path.parse::<Uri>() {
        *req.uri_mut() = uri;
    }

    strip_hop_by_hop(req.headers_mut());
    req
}

/// Drops hop-by-hop headers, including any listed in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
