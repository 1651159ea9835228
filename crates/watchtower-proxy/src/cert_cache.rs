//! Per-host leaf certificate cache.
//!
//! Leaves are minted lazily on the first interception of a host and kept
//! until they come within a day of expiry. Each host owns one
//! [`OnceCell`], so concurrent first requests for the same host share a
//! single generation instead of racing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::debug;

use watchtower_core::host::normalize_host;

use crate::ca::RootCa;
use crate::error::{ProxyError, Result};
use crate::tls::crypto_provider;

/// Default leaf lifetime, the longest browsers accept.
pub const DEFAULT_LEAF_VALIDITY_DAYS: i64 = 397;

/// Leaves this close to expiry are re-issued.
const RENEW_BEFORE: Duration = Duration::days(1);

/// An issued leaf and the TLS server config built around it.
pub struct LeafCert {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub not_after: OffsetDateTime,
    pub server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for LeafCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCert")
            .field("host", &self.host)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl LeafCert {
    fn needs_renewal(&self, now: OffsetDateTime) -> bool {
        self.not_after - RENEW_BEFORE <= now
    }
}

type Slot = Arc<OnceCell<Arc<LeafCert>>>;

/// Lazily populated host → leaf cache bound to one root CA.
pub struct CertCache {
    root: RwLock<Arc<RootCa>>,
    entries: Mutex<HashMap<String, Slot>>,
    leaf_validity: Duration,
    generated: AtomicU64,
}

impl CertCache {
    pub fn new(root: RootCa) -> Self {
        Self {
            root: RwLock::new(Arc::new(root)),
            entries: Mutex::new(HashMap::new()),
            leaf_validity: Duration::days(DEFAULT_LEAF_VALIDITY_DAYS),
            generated: AtomicU64::new(0),
        }
    }

    /// Overrides the lifetime of newly issued leaves.
    pub fn with_leaf_validity(mut self, validity: Duration) -> Self {
        self.leaf_validity = validity;
        self
    }

    /// The root currently signing leaves.
    pub fn root(&self) -> Arc<RootCa> {
        self.root.read().clone()
    }

    /// Swaps the signing root and drops every cached leaf.
    pub fn replace_root(&self, root: RootCa) {
        *self.root.write() = Arc::new(root);
        self.entries.lock().clear();
        debug!("Root CA replaced, leaf cache cleared");
    }

    /// Number of leaves minted so far.
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Number of hosts with a cache slot.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached leaf for `host`, issuing one if needed.
    pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCert>> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(ProxyError::CertIssuanceFailed {
                host,
                reason: "empty host".to_string(),
            });
        }

        let slot = self.slot_for(&host);
        let leaf = slot
            .get_or_try_init(|| async {
                let root = self.root();
                let validity = self.leaf_validity;
                let issue_host = host.clone();

                let leaf = tokio::task::spawn_blocking(move || {
                    issue_leaf(&root, &issue_host, validity)
                })
                .await
                .map_err(|e| ProxyError::CertIssuanceFailed {
                    host: host.clone(),
                    reason: e.to_string(),
                })??;

                self.generated.fetch_add(1, Ordering::Relaxed);
                debug!(host = %host, "Issued leaf certificate");
                Ok::<_, ProxyError>(Arc::new(leaf))
            })
            .await?;

        Ok(leaf.clone())
    }

    /// Existing slot, or a fresh one when absent or due for renewal.
    fn slot_for(&self, host: &str) -> Slot {
        let mut entries = self.entries.lock();
        let now = OffsetDateTime::now_utc();

        let stale = entries
            .get(host)
            .and_then(|slot| slot.get())
            .is_some_and(|leaf| leaf.needs_renewal(now));
        if stale {
            entries.remove(host);
        }

        entries
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

/// Signs a leaf for `host` with the root.
fn issue_leaf(root: &RootCa, host: &str, validity: Duration) -> Result<LeafCert> {
    let fail = |reason: String| ProxyError::CertIssuanceFailed {
        host: host.to_string(),
        reason,
    };

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip)],
        Err(_) => vec![SanType::DnsName(
            host.try_into()
                .map_err(|_| fail(format!("invalid DNS name {}", host)))?,
        )],
    };
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + validity;

    let key_pair = KeyPair::generate().map_err(|e| fail(e.to_string()))?;
    let cert = params
        .signed_by(&key_pair, root.issuer())
        .map_err(|e| fail(e.to_string()))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| fail(e.to_string()))?;

    let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| fail(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone(), root.cert_der().clone()], key_der)
        .map_err(|e| fail(e.to_string()))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(LeafCert {
        host: host.to_string(),
        cert_der,
        cert_pem: cert.pem(),
        not_after: params.not_after,
        server_config: Arc::new(server_config),
    })
}
