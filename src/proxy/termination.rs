//! Ephemeral TLS termination listeners for intercepted tunnels.
//!
//! An intercepted CONNECT tunnel is spliced into a local listener that
//! terminates TLS with a forged leaf and hands the decrypted stream to the
//! HTTP pipeline.
//!
//! - Named hosts share one listener, keyed [`SNI_ENDPOINT_KEY`], which issues
//!   a leaf per handshake from the ClientHello server name.
//! - A literal IP cannot be addressed by SNI, so each IP gets a dedicated
//!   listener presenting a certificate issued once for that address.
//!
//! Listeners bind `127.0.0.1:0`; the OS-assigned port is never reused while
//! the endpoint is alive.

use super::error::{ProxyError, ProxyResult};
use super::tls::{CertificateCache, accept_with_sni, server_config_for};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

/// Key of the shared SNI listener.
pub const SNI_ENDPOINT_KEY: &str = "127.0.0.1";

const LOOPBACK: &str = "127.0.0.1";

/// Receives each decrypted client connection.
pub type DecryptedHandler = Arc<dyn Fn(TlsStream<TcpStream>, SocketAddr) + Send + Sync>;

/// Location of a termination listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint key.
    pub host: String,
    /// Local port on 127.0.0.1.
    pub port: u16,
}

struct Endpoint {
    port: u16,
    task: JoinHandle<()>,
}

/// Pool of termination listeners.
pub struct TerminationManager {
    certs: Arc<CertificateCache>,
    handler: DecryptedHandler,
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl TerminationManager {
    /// Create an empty pool.
    pub fn new(certs: Arc<CertificateCache>, handler: DecryptedHandler) -> Self {
        Self {
            certs,
            handler,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Return the listener that terminates TLS for `hostname`, creating it if needed.
    pub async fn get_or_create_endpoint(&self, hostname: &str) -> ProxyResult<EndpointInfo> {
        let bare = hostname.trim_start_matches('[').trim_end_matches(']');
        let ip = bare.parse::<IpAddr>().ok();
        let key = endpoint_key(ip);

        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(&key) {
            return Ok(EndpointInfo {
                host: key,
                port: endpoint.port,
            });
        }

        let listener = TcpListener::bind((LOOPBACK, 0))
            .await
            .map_err(|source| ProxyError::Bind {
                addr: format!("{}:0", LOOPBACK),
                source,
            })?;
        let port = listener.local_addr()?.port();

        let task = match ip {
            Some(ip) => {
                let certs = self.certs.clone();
                let name = ip.to_string();
                let key = tokio::task::spawn_blocking(move || certs.get_or_issue(&name))
                    .await
                    .map_err(|e| ProxyError::Tls(format!("Certificate task failed: {}", e)))??;
                let acceptor = TlsAcceptor::from(server_config_for(key));
                tokio::spawn(serve_static(listener, acceptor, self.handler.clone()))
            }
            None => tokio::spawn(serve_sni(
                listener,
                self.certs.clone(),
                self.handler.clone(),
            )),
        };

        info!("Termination endpoint {} listening on {}:{}", key, LOOPBACK, port);

        endpoints.insert(key.clone(), Endpoint { port, task });
        Ok(EndpointInfo { host: key, port })
    }

    /// Close the listeners for `keys`, or every listener when `None`.
    ///
    /// Unknown keys are ignored, so closing twice is harmless.
    pub async fn close(&self, keys: Option<&[&str]>) {
        let mut endpoints = self.endpoints.lock().await;
        let closing: Vec<String> = match keys {
            Some(keys) => keys.iter().map(|k| k.to_string()).collect(),
            None => endpoints.keys().cloned().collect(),
        };
        for key in closing {
            if let Some(endpoint) = endpoints.remove(&key) {
                endpoint.task.abort();
                debug!("Closed termination endpoint {} (port {})", key, endpoint.port);
            }
        }
    }

    /// Number of live listeners.
    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.lock().await.len()
    }

    /// Port of the listener with `key`.
    pub async fn port_of(&self, key: &str) -> Option<u16> {
        self.endpoints.lock().await.get(key).map(|e| e.port)
    }
}

impl Drop for TerminationManager {
    fn drop(&mut self) {
        for endpoint in self.endpoints.get_mut().values() {
            endpoint.task.abort();
        }
    }
}

/// Key for an endpoint. IPs get their own key, distinct from the SNI listener.
fn endpoint_key(ip: Option<IpAddr>) -> String {
    match ip {
        Some(ip) if ip.to_string() == SNI_ENDPOINT_KEY => format!("{}#static", ip),
        Some(ip) => ip.to_string(),
        None => SNI_ENDPOINT_KEY.to_string(),
    }
}

async fn serve_sni(listener: TcpListener, certs: Arc<CertificateCache>, handler: DecryptedHandler) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Termination endpoint accept failed: {}", e);
                continue;
            }
        };
        let certs = certs.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            match accept_with_sni(stream, certs, None).await {
                Ok(tls) => handler(tls, peer),
                Err(e) => debug!("Termination handshake from {} failed: {}", peer, e),
            }
        });
    }
}

async fn serve_static(listener: TcpListener, acceptor: TlsAcceptor, handler: DecryptedHandler) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Termination endpoint accept failed: {}", e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => handler(tls, peer),
                Err(e) => debug!("Termination handshake from {} failed: {}", peer, e),
            }
        });
    }
}
