//! Name resolution for pass-through traffic.
//!
//! With no DNS server configured, hosts resolve through the system
//! resolver. With one configured, a hickory resolver pointed at that server
//! is tried first; a failed lookup falls back to the system resolver.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

const DEFAULT_DNS_PORT: u16 = 53;

/// Parses a configured DNS server (`ip` or `ip:port`, IPv6 in brackets when
/// a port is given). Blank input means "use the system resolver".
pub fn parse_dns_server(value: &str) -> Result<Option<SocketAddr>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }

    let bare = value.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| Some(SocketAddr::new(ip, DEFAULT_DNS_PORT)))
        .map_err(|_| ProxyError::InvalidDnsServer(value.to_string()))
}

/// Resolver used for opaque tunnels and pass-through upstream connections.
#[derive(Clone, Default)]
pub struct DnsOverride {
    resolver: Option<Arc<TokioResolver>>,
    server: Option<SocketAddr>,
}

impl std::fmt::Debug for DnsOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsOverride")
            .field("server", &self.server)
            .finish()
    }
}

impl DnsOverride {
    /// System resolution only.
    pub fn system() -> Self {
        Self::default()
    }

    /// Resolves through the given DNS server.
    pub fn with_server(server: SocketAddr) -> Self {
        let config = ResolverConfig::from_parts(
            None,
            vec![],
            NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true),
        );
        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();

        Self {
            resolver: Some(Arc::new(resolver)),
            server: Some(server),
        }
    }

    /// Builds from the persisted `dnsServer` setting.
    pub fn from_setting(dns_server: Option<&str>) -> Result<Self> {
        match dns_server.map(parse_dns_server).transpose()?.flatten() {
            Some(server) => Ok(Self::with_server(server)),
            None => Ok(Self::system()),
        }
    }

    /// The configured server, if any.
    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Resolves `host` to socket addresses on `port`.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        if let Some(resolver) = &self.resolver {
            match resolver.lookup_ip(bare).await {
                Ok(lookup) => {
                    let addrs: Vec<SocketAddr> =
                        lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
                    if !addrs.is_empty() {
                        debug!(host = %bare, server = ?self.server, "Resolved via DNS override");
                        return Ok(addrs);
                    }
                }
                Err(e) => {
                    warn!(host = %bare, "DNS override lookup failed, using system resolver: {}", e)
                }
            }
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((bare, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for host: {}", bare),
            ));
        }
        Ok(addrs)
    }
}
