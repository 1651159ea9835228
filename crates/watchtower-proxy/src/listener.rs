//! Listener binding and accept loops.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::handler::{accept_tls, serve_http1, ProxyContext, RequestOrigin};

/// Server name assumed when a reverse HTTPS client sends no SNI.
const DEFAULT_REVERSE_TLS_HOST: &str = "localhost";

/// Which role a listener plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Forward,
    ReverseHttp,
    ReverseHttps,
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerKind::Forward => write!(f, "forward"),
            ListenerKind::ReverseHttp => write!(f, "reverse-http"),
            ListenerKind::ReverseHttps => write!(f, "reverse-https"),
        }
    }
}

/// Binds `addr`, translating OS errors into start-up failures.
pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| map_bind_error(e, addr.port()))
}

/// `EADDRINUSE` on Linux (98), macOS (48) and Windows (10048).
pub(crate) fn map_bind_error(err: io::Error, port: u16) -> ProxyError {
    match err.kind() {
        io::ErrorKind::AddrInUse => ProxyError::PortInUse(port),
        io::ErrorKind::PermissionDenied => ProxyError::BindPermissionDenied(port),
        _ => match err.raw_os_error() {
            Some(98) | Some(48) | Some(10048) => ProxyError::PortInUse(port),
            _ => ProxyError::Io(err),
        },
    }
}

/// Accepts connections until the context's shutdown token fires.
pub(crate) fn spawn_accept_loop(
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
    kind: ListenerKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local = listener.local_addr().ok();
        info!(listener = %kind, addr = ?local, "Listener accepting connections");

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(listener = %kind, peer = %peer, "Accepted connection");
                        let conn_ctx = ctx.clone();
                        ctx.tracker.spawn(handle_connection(conn_ctx, stream, kind));
                    }
                    Err(e) => {
                        warn!(listener = %kind, "Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        info!(listener = %kind, addr = ?local, "Listener closed");
    })
}

async fn handle_connection(ctx: Arc<ProxyContext>, stream: TcpStream, kind: ListenerKind) {
    let _ = stream.set_nodelay(true);

    match kind {
        ListenerKind::Forward => serve_http1(ctx, stream, RequestOrigin::Forward).await,
        ListenerKind::ReverseHttp => {
            serve_http1(ctx, stream, RequestOrigin::Reverse { tls: false, sni: None }).await
        }
        ListenerKind::ReverseHttps => {
            if let Some((tls, sni)) = accept_tls(&ctx, stream, DEFAULT_REVERSE_TLS_HOST).await {
                let origin = RequestOrigin::Reverse {
                    tls: true,
                    sni: Some(sni),
                };
                serve_http1(ctx, tls, origin).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_errors_are_classified() {
        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        assert!(matches!(map_bind_error(in_use, 8888), ProxyError::PortInUse(8888)));

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            map_bind_error(denied, 80),
            ProxyError::BindPermissionDenied(80)
        ));
    }

    #[tokio::test]
    async fn binding_a_taken_port_is_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        match bind(addr).await {
            Err(ProxyError::PortInUse(port)) => assert_eq!(port, addr.port()),
            other => panic!("expected PortInUse, got {:?}", other.map(|_| ())),
        }
    }
}
