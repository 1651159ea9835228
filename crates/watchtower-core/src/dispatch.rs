//! Per-request dispatch over an immutable configuration snapshot.
//!
//! A [`ConfigSnapshot`] is taken once per connection or request and never
//! mutated; configuration edits build a new snapshot and swap it in. The
//! resolvers here are plain functions over that snapshot, evaluated in a
//! fixed order: mock, then local route, then pass-through.

use std::collections::{BTreeSet, HashMap};

use crate::host::{host_from_url, normalize_host, same_host};
use crate::mock::find_mock;
use crate::models::{ApiMock, Domain, DomainApiLoggingLink, LocalRoute};

/// Local development target for a routed host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub host: String,
    pub port: u16,
}

/// Decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Answer with a canned response; never touch the network.
    Mock(ApiMock),
    /// Forward to a local development server.
    Route(RouteTarget),
    /// Forward to the real upstream.
    PassThrough,
}

/// Capture settings for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Persist bodies as well as headers.
    pub body_enabled: bool,
}

/// Immutable view of everything dispatch depends on.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub local_routing_enabled: bool,
    /// In insertion order; the first match wins.
    pub routes: Vec<LocalRoute>,
    pub mocks: Vec<ApiMock>,
    /// Keyed by normalized host.
    pub capture: HashMap<String, CapturePolicy>,
}

impl ConfigSnapshot {
    /// Runs the resolver chain for one request.
    pub fn resolve(&self, host: &str, path: &str, method: &str) -> Disposition {
        if let Some(mock) = resolve_mock(&self.mocks, host, path, method) {
            return Disposition::Mock(mock.clone());
        }

        if let Some(target) = resolve_route(&self.routes, self.local_routing_enabled, host) {
            return Disposition::Route(target);
        }

        Disposition::PassThrough
    }

    /// Capture policy for a host, if any enabled logging link covers it.
    pub fn capture_policy(&self, host: &str) -> Option<CapturePolicy> {
        self.capture.get(&normalize_host(host)).copied()
    }

    /// Whether traffic to this host must be decrypted.
    ///
    /// True for hosts with an enabled mock, an active local route, or an
    /// enabled logging link. Everything else is tunneled opaquely.
    pub fn intercepts_host(&self, host: &str) -> bool {
        self.mocks
            .iter()
            .any(|m| m.enabled && same_host(&m.host, host))
            || resolve_route(&self.routes, self.local_routing_enabled, host).is_some()
            || self.capture_policy(host).is_some()
    }

    /// Sorted, de-duplicated list of every intercepted host.
    pub fn intercepted_hosts(&self) -> Vec<String> {
        let mut hosts = BTreeSet::new();

        hosts.extend(
            self.mocks
                .iter()
                .filter(|m| m.enabled)
                .map(|m| normalize_host(&m.host)),
        );

        if self.local_routing_enabled {
            hosts.extend(
                self.routes
                    .iter()
                    .filter(|r| r.enabled)
                    .map(|r| normalize_host(&r.domain)),
            );
        }

        hosts.extend(self.capture.keys().cloned());
        hosts.retain(|h| !h.is_empty());
        hosts.into_iter().collect()
    }
}

/// First enabled mock matching host, path and method.
pub fn resolve_mock<'a>(
    mocks: &'a [ApiMock],
    host: &str,
    path: &str,
    method: &str,
) -> Option<&'a ApiMock> {
    find_mock(mocks, host, path, method)
}

/// First enabled route for the host, only while local routing is on.
pub fn resolve_route(
    routes: &[LocalRoute],
    local_routing_enabled: bool,
    host: &str,
) -> Option<RouteTarget> {
    if !local_routing_enabled {
        return None;
    }

    routes
        .iter()
        .find(|r| r.enabled && same_host(&r.domain, host))
        .map(|r| RouteTarget {
            host: r.target_host.clone(),
            port: r.target_port,
        })
}

/// Builds the host → capture policy map from domains and their links.
///
/// A link contributes the host of its domain URL and the host of its
/// schema URL. Disabled links contribute nothing. When several links map
/// to the same host, bodies are captured if any of them asks for it.
pub fn build_capture_map(
    domains: &[Domain],
    links: &[DomainApiLoggingLink],
) -> HashMap<String, CapturePolicy> {
    let mut map: HashMap<String, CapturePolicy> = HashMap::new();

    for link in links.iter().filter(|l| l.logging_enabled) {
        let domain_host = domains
            .iter()
            .find(|d| d.id == link.domain_id)
            .and_then(|d| host_from_url(&d.url));
        let schema_host = link.schema_url.as_deref().and_then(host_from_url);

        for host in domain_host.into_iter().chain(schema_host) {
            map.entry(host)
                .and_modify(|p| p.body_enabled |= link.body_enabled)
                .or_insert(CapturePolicy {
                    body_enabled: link.body_enabled,
                });
        }
    }

    map
}
