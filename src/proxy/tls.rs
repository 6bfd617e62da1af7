//! TLS plumbing for the MITM proxy.
//!
//! This module provides:
//! - Leaf issuance for intercepted hosts, with an optional bounded cache
//! - SNI-driven acceptance: the ClientHello is read first, then a leaf for
//!   the requested name is issued on the blocking pool
//! - TLS connector for upstream connections (proxy as client)
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN on both sides. If HTTP/2 is
//! negotiated, clients will switch to H2 framing after the handshake and the
//! HTTP/1.1 pipeline behind the termination listeners cannot parse it.

use super::error::{ProxyError, ProxyResult};
use crate::ca::{LeafCertificate, RootAuthority};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

/// Upper bound on cached leaves when caching is enabled.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

const ALPN_HTTP1: &[u8] = b"http/1.1";

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Arc<CertifiedKey>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

/// Issues TLS identities for intercepted hosts.
///
/// With caching disabled every call issues a fresh key pair and
/// certificate. With caching enabled, identities are kept per lower-cased
/// hostname and the oldest entry is evicted once the capacity is reached.
pub struct CertificateCache {
    ca: Arc<RootAuthority>,
    enabled: bool,
    capacity: usize,
    state: RwLock<CacheState>,
}

impl CertificateCache {
    /// Create a cache backed by `ca`.
    pub fn new(ca: Arc<RootAuthority>, enabled: bool) -> Self {
        Self::with_capacity(ca, enabled, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a cache with an explicit capacity.
    pub fn with_capacity(ca: Arc<RootAuthority>, enabled: bool, capacity: usize) -> Self {
        Self {
            ca,
            enabled,
            capacity: capacity.max(1),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Get a cached identity for `domain` or issue a new one.
    ///
    /// Issuance generates an RSA key, so call this from a blocking context.
    pub fn get_or_issue(&self, domain: &str) -> ProxyResult<Arc<CertifiedKey>> {
        let domain_lower = domain.to_lowercase();

        if self.enabled {
            let state = self.state.read().unwrap();
            if let Some(key) = state.entries.get(&domain_lower) {
                trace!("Certificate cache hit for {}", domain);
                return Ok(key.clone());
            }
        }

        let leaf = self.ca.issue_leaf(domain)?;
        let certified_key = certified_key_from_leaf(&leaf)?;

        if self.enabled {
            let mut state = self.state.write().unwrap();
            if !state.entries.contains_key(&domain_lower) {
                while state.entries.len() >= self.capacity {
                    let Some(oldest) = state.order.pop_front() else {
                        break;
                    };
                    state.entries.remove(&oldest);
                }
                state.order.push_back(domain_lower.clone());
            }
            state.entries.insert(domain_lower, certified_key.clone());
        }

        Ok(certified_key)
    }

    /// Whether issued identities are cached.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Drop every cached identity.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        state.entries.clear();
        state.order.clear();
        debug!("Certificate cache cleared");
    }

    /// Number of cached identities.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().entries.is_empty()
    }
}

/// Turn an issued leaf into a rustls signing identity.
pub fn certified_key_from_leaf(leaf: &LeafCertificate) -> ProxyResult<Arc<CertifiedKey>> {
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut leaf.certificate_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut leaf.private_key_pem.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
            .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(cert_chain, signing_key)))
}

/// Resolver that always presents one identity.
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build a server configuration presenting `key`, pinned to HTTP/1.1.
pub fn server_config_for(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(key)));

    // CRITICAL: Force HTTP/1.1 to prevent HTTP/2 negotiation.
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Arc::new(config)
}

/// Accept a TLS connection, issuing a leaf for the ClientHello server name.
///
/// `fallback_host` is used when the client sends no SNI; without it such
/// handshakes are rejected. Failures affect only this connection.
pub async fn accept_with_sni<IO>(
    io: IO,
    cache: Arc<CertificateCache>,
    fallback_host: Option<&str>,
) -> ProxyResult<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), io)
        .await
        .map_err(|e| ProxyError::Tls(format!("Failed to read ClientHello: {}", e)))?;

    let host = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .or_else(|| fallback_host.map(str::to_string))
        .ok_or_else(|| ProxyError::Tls("ClientHello carries no server name".into()))?;

    trace!("Resolving certificate for: {}", host);

    let key = tokio::task::spawn_blocking(move || cache.get_or_issue(&host))
        .await
        .map_err(|e| ProxyError::Tls(format!("Certificate task failed: {}", e)))??;

    start
        .into_stream(server_config_for(key))
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))
}

/// Create a TLS connector for upstream connections.
///
/// Upstream certificates are verified against the system roots plus
/// `extra_roots`, unless `ignore_unauthorized` disables verification.
pub fn create_tls_connector(
    ignore_unauthorized: bool,
    extra_roots: &[CertificateDer<'static>],
) -> ProxyResult<TlsConnector> {
    let mut config = if ignore_unauthorized {
        warn!("Upstream certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs();

        // Log any errors but continue with successfully loaded certs
        for err in native_certs.errors {
            debug!("Warning loading native cert: {}", err);
        }

        for cert in native_certs.certs.into_iter().chain(extra_roots.iter().cloned()) {
            if let Err(e) = root_store.add(cert) {
                debug!("Warning adding cert to store: {}", e);
            }
        }

        if root_store.is_empty() {
            warn!("No root certificates loaded; every upstream TLS handshake will fail");
        } else {
            debug!("Loaded {} root certificates", root_store.len());
        }

        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Map an upstream handshake failure, separating certificate rejection.
pub fn classify_tls_error(host: &str, err: io::Error) -> ProxyError {
    let rejected = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)));

    if rejected {
        ProxyError::Trust {
            host: host.to_string(),
            message: err.to_string(),
        }
    } else {
        ProxyError::Tls(format!("Upstream TLS handshake with {} failed: {}", host, err))
    }
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> ProxyResult<ServerName<'static>> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

/// Verifier that accepts any upstream certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
