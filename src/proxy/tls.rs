//! TLS interception: leaf certificate cache, SNI-driven resolver, and the
//! acceptor/connector pair.
//!
//! # Issuance
//!
//! Leaf certificates are cached per domain until they expire. Issuance for
//! one domain is serialized behind a per-domain lock with a second cache
//! check inside it, so simultaneous first contacts sign exactly once while
//! other domains proceed in parallel. The lock is dropped from the gate map
//! once issuance finishes, and each new issuance evicts expired leaves.
//!
//! # ALPN
//!
//! The acceptor advertises only `http/1.1`. The interception path parses
//! requests with an HTTP/1 server and cannot handle HTTP/2 framing.

use super::ca::{CertBundle, CertificateAuthority};
use super::error::ProxyError;
use parking_lot::{Mutex, RwLock};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace};

#[derive(Clone)]
struct CachedCert {
    bundle: Arc<CertBundle>,
    key: Arc<CertifiedKey>,
}

/// Per-domain leaf certificate cache.
pub struct CertificateCache {
    ca: Arc<CertificateAuthority>,
    cache: RwLock<HashMap<String, CachedCert>>,
    issuing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    issued: AtomicUsize,
}

impl CertificateCache {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            cache: RwLock::new(HashMap::new()),
            issuing: Mutex::new(HashMap::new()),
            issued: AtomicUsize::new(0),
        }
    }

    /// The signing authority.
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Leaf bundle for `domain`, issuing one if none is cached or the cached
    /// one has expired. Repeated calls within the validity window return the
    /// same bundle.
    pub fn generate_cert_for_domain(&self, domain: &str) -> Result<Arc<CertBundle>, ProxyError> {
        Ok(self.get_or_issue(domain)?.bundle)
    }

    /// Signing key for `domain`, for the TLS handshake.
    pub fn get_or_generate(&self, domain: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        Ok(self.get_or_issue(domain)?.key)
    }

    fn get_or_issue(&self, domain: &str) -> Result<CachedCert, ProxyError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if let Some(hit) = self.lookup(&domain) {
            trace!(domain = %domain, "Certificate cache hit");
            return Ok(hit);
        }

        let gate = Arc::clone(self.issuing.lock().entry(domain.clone()).or_default());
        let _held = gate.lock();
        let result = match self.lookup(&domain) {
            Some(hit) => Ok(hit),
            None => self.issue(&domain),
        };

        let mut issuing = self.issuing.lock();
        if issuing.get(&domain).is_some_and(|g| Arc::ptr_eq(g, &gate)) {
            issuing.remove(&domain);
        }
        result
    }

    fn issue(&self, domain: &str) -> Result<CachedCert, ProxyError> {
        let bundle = self.ca.issue_leaf(domain)?;
        let key = certified_key(&bundle)?;
        self.issued.fetch_add(1, Ordering::SeqCst);

        let entry = CachedCert {
            bundle: Arc::new(bundle),
            key: Arc::new(key),
        };
        let now = OffsetDateTime::now_utc();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, c| c.bundle.is_valid_at(now));
        let evicted = before - cache.len();
        cache.insert(domain.to_string(), entry.clone());
        debug!(domain, evicted, "Cached new leaf certificate");
        Ok(entry)
    }

    fn lookup(&self, domain: &str) -> Option<CachedCert> {
        let now = OffsetDateTime::now_utc();
        self.cache
            .read()
            .get(domain)
            .filter(|c| c.bundle.is_valid_at(now))
            .cloned()
    }

    /// Number of leaf certificates signed so far.
    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("cached", &self.len())
            .field("issued", &self.issued_count())
            .finish()
    }
}

fn certified_key(bundle: &CertBundle) -> Result<CertifiedKey, ProxyError> {
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut bundle.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;
    if cert_chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut bundle.key_pem.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
            .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// Resolves the presented certificate from SNI, falling back to the host
/// named in the CONNECT request.
pub struct DynamicCertResolver {
    cache: Arc<CertificateCache>,
    domain_hint: Option<String>,
}

impl DynamicCertResolver {
    pub fn new(cache: Arc<CertificateCache>, domain_hint: Option<String>) -> Self {
        Self { cache, domain_hint }
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello
            .server_name()
            .map(|s| s.to_string())
            .or_else(|| self.domain_hint.clone())?;

        match self.cache.get_or_generate(&domain) {
            Ok(key) => Some(key),
            Err(e) => {
                error!(domain = %domain, error = %e, "Failed to issue certificate");
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("domain_hint", &self.domain_hint)
            .finish()
    }
}

/// Acceptor for the client side of an intercepted connection.
pub fn create_tls_acceptor(
    cert_cache: Arc<CertificateCache>,
    domain_hint: Option<String>,
) -> TlsAcceptor {
    let resolver = Arc::new(DynamicCertResolver::new(cert_cache, domain_hint));
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// Connector for upstream servers, verifying against the system roots.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }
    debug!("Loaded {} root certificates", root_store.len());

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host name to a `ServerName` for an upstream handshake.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}
