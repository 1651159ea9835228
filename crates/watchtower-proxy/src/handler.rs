//! Per-connection request handling.
//!
//! Every listener ends up here: the forward listener with absolute-form
//! requests and CONNECT, the reverse listeners with origin-form requests
//! named by `Host`, and decrypted tunnels with origin-form requests whose
//! host came from the CONNECT line.

use std::convert::Infallible;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use watchtower_core::host::{normalize_host, split_authority};
use watchtower_core::mock::path_only;
use watchtower_core::{ApiMock, Disposition, LogSource};

use crate::body::{empty, full, response_with, text_response, ProxyBody};
use crate::capture::{Exchange, TrafficRecorder};
use crate::cert_cache::CertCache;
use crate::dns::DnsOverride;
use crate::endpoints::{self, CERT_ENDPOINT_PREFIX, ENDPOINT_PREFIX};
use crate::state::SharedConfig;
use crate::upstream::{strip_hop_by_hop, Destination, Upstream};

/// Marks requests that already left this proxy once.
pub(crate) const HOP_HEADER: HeaderName = HeaderName::from_static("x-watchtower-hop");

/// Everything a connection task needs, shared by all connections of one
/// proxy run.
pub struct ProxyContext {
    pub(crate) config: SharedConfig,
    pub(crate) certs: Arc<CertCache>,
    pub(crate) dns: DnsOverride,
    pub(crate) recorder: TrafficRecorder,
    pub(crate) upstream: Upstream,
    /// Port the forward listener actually bound.
    pub(crate) forward_port: u16,
    /// Stops accept loops and starts draining connections.
    pub(crate) shutdown: CancellationToken,
    /// Drops whatever is still open after the grace period.
    pub(crate) force: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

/// How the connection carrying a request was established.
#[derive(Debug, Clone)]
pub(crate) enum RequestOrigin {
    /// Plain connection to the forward listener.
    Forward,
    /// Decrypted CONNECT tunnel.
    Tunnel { host: String, port: u16 },
    /// Reverse listener; `sni` is the TLS server name when encrypted.
    Reverse { tls: bool, sni: Option<String> },
}

/// Where a request was headed before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Path without the query string.
    pub path: String,
    pub url: String,
}

/// Serves HTTP/1.1 on `io` until the client leaves or the proxy stops.
pub(crate) async fn serve_http1<I>(ctx: Arc<ProxyContext>, io: I, origin: RequestOrigin)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service_ctx = ctx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = service_ctx.clone();
        let origin = origin.clone();
        async move { Ok::<_, Infallible>(handle_request(ctx, req, origin).await) }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection ended with error: {}", e);
                }
                break;
            }
            _ = ctx.shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = ctx.force.cancelled() => {
                debug!("Force-closing connection");
                break;
            }
        }
    }
}

/// Terminates client TLS with a leaf for the client's SNI (or `fallback_host`).
pub(crate) async fn accept_tls<I>(
    ctx: &ProxyContext,
    io: I,
    fallback_host: &str,
) -> Option<(TlsStream<I>, String)>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    let start = match LazyConfigAcceptor::new(Acceptor::default(), io).await {
        Ok(start) => start,
        Err(e) => {
            debug!(host = %fallback_host, "TLS client hello failed: {}", e);
            return None;
        }
    };

    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| fallback_host.to_string());

    let leaf = match ctx.certs.leaf_for(&server_name).await {
        Ok(leaf) => leaf,
        Err(e) => {
            warn!(host = %server_name, "Cannot intercept connection: {}", e);
            return None;
        }
    };

    match start.into_stream(leaf.server_config.clone()).await {
        Ok(stream) => Some((stream, server_name)),
        Err(e) => {
            debug!(host = %server_name, "Client TLS handshake failed: {}", e);
            None
        }
    }
}

async fn handle_request(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    origin: RequestOrigin,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        return match origin {
            RequestOrigin::Forward => handle_connect(ctx, req).await,
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "CONNECT is not supported here"),
        };
    }

    if req.headers().contains_key(HOP_HEADER) {
        warn!(uri = %req.uri(), "Request looped back into the proxy");
        return text_response(StatusCode::LOOP_DETECTED, "Request looped back into Watchtower");
    }

    if is_endpoint_request(&ctx, &req, &origin) {
        let host = host_header(&req).unwrap_or_default();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        return endpoints::serve(&ctx, &path, &host).await;
    }

    match request_target(&req, &origin) {
        Some(target) => proxy_request(&ctx, req, target).await,
        None => text_response(StatusCode::BAD_REQUEST, "Request has no target host"),
    }
}

/// Answers a CONNECT: decrypted when the host is intercepted, an opaque
/// byte tunnel otherwise.
async fn handle_connect(ctx: Arc<ProxyContext>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
    };
    let host = normalize_host(authority.host());
    let port = authority.port_u16().unwrap_or(443);

    if ctx.config.snapshot().intercepts_host(&host) {
        debug!(host = %host, port, "Intercepting CONNECT");
        ctx.tracker.spawn(serve_decrypted(ctx.clone(), req, host, port));
        return Response::new(empty());
    }

    let server = match ctx.upstream.connect_tunnel(&host, port, &ctx.dns).await {
        Ok(server) => server,
        Err(e) => {
            warn!(host = %host, port, "Tunnel target unreachable: {}", e);
            return text_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    debug!(host = %host, port, "Opening tunnel");
    let task_ctx = ctx.clone();
    ctx.tracker.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => tunnel(&task_ctx, upgraded, server, &host).await,
            Err(e) => warn!(host = %host, "CONNECT upgrade failed: {}", e),
        }
    });
    Response::new(empty())
}

/// Decrypts an upgraded CONNECT and serves the requests inside it.
///
/// Boxed because it re-enters `serve_http1`, which leads back here.
fn serve_decrypted(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    host: String,
    port: u16,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                if let Some((tls, _)) = accept_tls(&ctx, io, &host).await {
                    let origin = RequestOrigin::Tunnel { host, port };
                    serve_http1(ctx, tls, origin).await;
                }
            }
            Err(e) => warn!(host = %host, "CONNECT upgrade failed: {}", e),
        }
    })
}

async fn tunnel(
    ctx: &ProxyContext,
    upgraded: hyper::upgrade::Upgraded,
    mut server: TcpStream,
    host: &str,
) {
    let mut client = TokioIo::new(upgraded);
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut server) => match result {
            Ok((up, down)) => debug!(host = %host, up, down, "Tunnel closed"),
            Err(e) => debug!(host = %host, "Tunnel ended: {}", e),
        },
        _ = ctx.force.cancelled() => debug!(host = %host, "Force-closing tunnel"),
    }
}

/// Runs the dispatch chain for one request and produces the response.
async fn proxy_request(
    ctx: &ProxyContext,
    req: Request<Incoming>,
    target: RequestTarget,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let snapshot = ctx.config.snapshot();
    let method = req.method().as_str().to_string();
    let disposition = snapshot.resolve(&target.host, &target.path, &method);
    let capture = snapshot.capture_policy(&target.host);
    drop(snapshot);

    debug!(
        host = %target.host,
        method = %method,
        path = %target.path,
        disposition = disposition_name(&disposition),
        captured = capture.is_some(),
        "Dispatching request"
    );

    let Some(policy) = capture else {
        return match disposition {
            Disposition::Mock(mock) => mock_response(&mock),
            other => forward(ctx, destination(&other, &target), req.map(|b| b.boxed())).await,
        };
    };

    let (parts, body) = req.into_parts();
    let request_headers = parts.headers.clone();
    let request_body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(host = %target.host, "Client body read failed: {}", e);
            return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let response = match disposition {
        Disposition::Mock(mock) => mock_response(&mock),
        other => {
            let req = Request::from_parts(parts, full(request_body.clone()));
            forward(ctx, destination(&other, &target), req).await
        }
    };

    let (parts, body) = response.into_parts();
    let response_body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(host = %target.host, "Upstream body read failed: {}", e);
            return text_response(StatusCode::BAD_GATEWAY, "Upstream response was cut short");
        }
    };

    let entry = Exchange {
        method: &method,
        url: target.url.clone(),
        host: &target.host,
        path: &target.path,
        status_code: parts.status.as_u16(),
        request_headers: &request_headers,
        request_body: &request_body,
        response_headers: &parts.headers,
        response_body: &response_body,
        started,
    }
    .into_entry(policy.body_enabled, LogSource::Proxy);
    ctx.recorder.record(entry);

    Response::from_parts(parts, full(response_body))
}

async fn forward(
    ctx: &ProxyContext,
    dest: Destination,
    mut req: Request<ProxyBody>,
) -> Response<ProxyBody> {
    req.headers_mut()
        .insert(HOP_HEADER, HeaderValue::from_static("1"));
    match ctx.upstream.send(&dest, req, &ctx.dns).await {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            response
        }
        Err(e) => {
            warn!(destination = ?dest, "Upstream request failed: {}", e);
            text_response(StatusCode::BAD_GATEWAY, format!("Watchtower proxy error: {}", e))
        }
    }
}

fn destination(disposition: &Disposition, target: &RequestTarget) -> Destination {
    match disposition {
        Disposition::Route(route) => Destination::Local {
            host: route.host.clone(),
            port: route.port,
        },
        _ => Destination::Origin {
            host: target.host.clone(),
            port: target.port,
            tls: target.tls,
        },
    }
}

fn disposition_name(disposition: &Disposition) -> &'static str {
    match disposition {
        Disposition::Mock(_) => "mock",
        Disposition::Route(_) => "route",
        Disposition::PassThrough => "pass-through",
    }
}

pub(crate) fn mock_response(mock: &ApiMock) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(mock.status_code).unwrap_or(StatusCode::OK);
    let mut response = response_with(
        status,
        &mock.content_type,
        Bytes::from(mock.response_body.clone()),
    );
    response
        .headers_mut()
        .insert("x-watchtower-mock", HeaderValue::from_static("1"));
    response
}

fn host_header<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Requests the proxy answers itself instead of forwarding.
fn is_endpoint_request<B>(ctx: &ProxyContext, req: &Request<B>, origin: &RequestOrigin) -> bool {
    let uri = req.uri();

    // Inside a tunnel only certificate downloads are answered locally
    if matches!(origin, RequestOrigin::Tunnel { .. }) {
        return uri.path().starts_with(CERT_ENDPOINT_PREFIX);
    }

    if uri.authority().is_none() && uri.path().starts_with(ENDPOINT_PREFIX) {
        return true;
    }

    if !matches!(origin, RequestOrigin::Forward) {
        return false;
    }

    // Anything addressed to the forward listener itself would loop
    match uri.authority() {
        Some(authority) => addressed_to_self(
            authority.host(),
            Some(authority.port_u16().unwrap_or(80)),
            ctx.forward_port,
        ),
        None => host_header(req)
            .map(|h| {
                let (host, port) = split_authority(&h);
                addressed_to_self(host, Some(port.unwrap_or(80)), ctx.forward_port)
            })
            .unwrap_or(false),
    }
}

fn addressed_to_self(host: &str, port: Option<u16>, forward_port: u16) -> bool {
    if port != Some(forward_port) {
        return false;
    }
    let host = normalize_host(host);
    host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback() || ip.is_unspecified())
            .unwrap_or(false)
}

/// Works out the target host, port and scheme of a request.
pub(crate) fn request_target<B>(req: &Request<B>, origin: &RequestOrigin) -> Option<RequestTarget> {
    let uri = req.uri();
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let (host, port, tls) = match origin {
        RequestOrigin::Tunnel { host, port } => (host.clone(), *port, true),
        RequestOrigin::Forward => match uri.authority() {
            Some(authority) => {
                let tls = uri.scheme_str() == Some("https");
                let default_port = if tls { 443 } else { 80 };
                (
                    normalize_host(authority.host()),
                    authority.port_u16().unwrap_or(default_port),
                    tls,
                )
            }
            None => {
                let header = host_header(req)?;
                let (host, port) = split_authority(&header);
                (normalize_host(host), port.unwrap_or(80), false)
            }
        },
        RequestOrigin::Reverse { tls, sni } => {
            let host = host_header(req)
                .map(|h| normalize_host(&h))
                .filter(|h| !h.is_empty())
                .or_else(|| sni.as_deref().map(normalize_host))?;
            (host, if *tls { 443 } else { 80 }, *tls)
        }
    };

    if host.is_empty() {
        return None;
    }

    Some(RequestTarget {
        url: display_url(tls, &host, port, path_and_query),
        path: path_only(path_and_query).to_string(),
        host,
        port,
        tls,
    })
}

fn display_url(tls: bool, host: &str, port: u16, path_and_query: &str) -> String {
    let (scheme, default_port) = if tls { ("https", 443) } else { ("http", 80) };
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    if port == default_port {
        format!("{}://{}{}", scheme, host, path_and_query)
    } else {
        format!("{}://{}:{}{}", scheme, host, port, path_and_query)
    }
}
