//! Watchtower Proxy - forward and reverse intercepting proxy.
//!
//! One [`ProxySupervisor`] owns up to three listeners sharing a single
//! [`ConfigSnapshot`](watchtower_core::ConfigSnapshot) view:
//!
//! - Forward proxy: absolute-form HTTP and `CONNECT` tunnels
//! - Reverse HTTP: origin-form requests, target taken from `Host`
//! - Reverse HTTPS: TLS terminated with a leaf for the SNI name
//!
//! ## Request flow
//!
//! ```text
//! CONNECT host:port
//!        │
//!   intercepted? ── no ──► opaque TCP tunnel
//!        │ yes
//!        ▼
//!   TLS with leaf from CertCache
//!        │
//!        ▼
//! HTTP request ──► /.watchtower/* ? ── yes ──► PAC, certificates, setup page
//!        │ no
//!        ▼
//!   mock ── hit ──► canned response
//!        │ miss
//!        ▼
//!   route ── hit ──► local dev server (plain HTTP/1.1)
//!        │ miss
//!        ▼
//!   upstream via DNS override
//!        │
//!        ▼
//!   capture (logging link) ──► TrafficRecorder ──► NDJSON per day
//! ```

mod body;
pub mod ca;
pub mod capture;
pub mod cert_cache;
pub mod dns;
pub mod endpoints;
mod error;
mod handler;
mod listener;
pub mod state;
mod supervisor;
mod tls;
pub mod upstream;

pub use ca::{CaManager, RootCa};
pub use capture::{captured_body, Exchange, TrafficRecorder};
pub use cert_cache::{CertCache, LeafCert};
pub use dns::{parse_dns_server, DnsOverride};
pub use endpoints::{pac_script, ENDPOINT_PREFIX};
pub use error::{CaManagerError, ProxyError, Result};
pub use handler::ProxyContext;
pub use listener::ListenerKind;
pub use state::{load_snapshot, SharedConfig};
pub use supervisor::{ProxyEvent, ProxySupervisor, DEFAULT_GRACE_PERIOD};
pub use upstream::{Destination, Upstream};
