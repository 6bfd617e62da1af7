//! HTTP proxy server implementation.
//!
//! This module provides the main proxy server that:
//! - Listens for client connections on the main TCP port (plain HTTP, or
//!   HTTPS with a leaf for the configured hostname)
//! - Handles HTTP CONNECT tunnels
//! - Handles plain HTTP requests and WebSocket upgrades
//! - Serves decrypted connections handed over by termination endpoints
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT
//! and WebSocket. Each connection is handled in a separate Tokio task. All
//! connections share one [`ProxyState`].
//!
//! # Example
//!
//! ```ignore
//! use eden_proxy::proxy::ProxyServerBuilder;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServerBuilder::new()
//!     .port(8001)
//!     .ca(ca)
//!     .build(shutdown_rx)?;
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::body::ProxyBody;
use super::connect::handle_connect;
use super::error::{ProxyError, ProxyResult};
use super::hooks::Hooks;
use super::http::handle_http;
use super::registry::ConnectionRegistry;
use super::termination::{DecryptedHandler, TerminationManager};
use super::throttle::Throttle;
use super::tls::{CertificateCache, create_tls_connector, server_config_for};
use super::websocket::{handle_websocket, is_websocket_upgrade};
use crate::ca::RootAuthority;
use crate::recorder::RecorderHandle;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use rustls_pki_types::CertificateDer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Response bodies larger than this are streamed instead of buffered.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 200 * 1024 * 1024;

/// Default bound on upstream dials and responses.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time open connections get to finish after shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the proxy server.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the main port on.
    pub bind_address: IpAddr,
    /// Main port. `0` lets the OS choose.
    pub port: u16,
    /// Serve the main port over TLS with a leaf for this hostname.
    pub https_hostname: Option<String>,
    /// Root authority that signs every forged leaf.
    pub ca: Arc<RootAuthority>,
    /// Intercept CONNECT tunnels when no rule decides.
    pub force_intercept: bool,
    /// Route plaintext WebSocket tunnels through the local pipeline.
    pub ws_intercept: bool,
    /// Skip upstream certificate verification.
    pub ignore_unauthorized: bool,
    /// Bandwidth cap for origin-to-client traffic.
    pub throttle: Option<Throttle>,
    /// Buffer limit before a response body is streamed.
    pub chunk_threshold: usize,
    /// Bound on upstream dials, handshakes and responses.
    pub upstream_timeout: Duration,
    /// Time open connections get to finish after shutdown.
    pub drain_timeout: Duration,
    /// Cache issued leaves.
    pub cache_leaves: bool,
    /// Additional roots trusted for upstream TLS.
    pub extra_roots: Vec<CertificateDer<'static>>,
    /// Interception rules.
    pub hooks: Hooks,
    /// Exchange recorder.
    pub recorder: RecorderHandle,
}

/// State shared by every connection the proxy serves.
pub struct ProxyState {
    pub(crate) hooks: Hooks,
    pub(crate) recorder: RecorderHandle,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) termination: TerminationManager,
    pub(crate) connector: TlsConnector,
    pub(crate) throttle: Option<Throttle>,
    pub(crate) force_intercept: bool,
    pub(crate) ws_intercept: bool,
    pub(crate) chunk_threshold: usize,
    pub(crate) upstream_timeout: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) local_port: OnceLock<u16>,
    /// Connection, tunnel and WebSocket tasks awaited on shutdown.
    pub(crate) tasks: TaskTracker,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyState {
    /// Termination listeners for intercepted tunnels.
    pub fn termination(&self) -> &TerminationManager {
        &self.termination
    }
}

/// The main proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
    /// Leaf certificates for TLS interception.
    cert_cache: Arc<CertificateCache>,
    /// Acceptor for the main port when it serves HTTPS.
    main_tls: Option<TlsAcceptor>,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// # Arguments
    ///
    /// * `config` - Proxy configuration.
    /// * `shutdown_rx` - Receiver for shutdown signal.
    pub fn new(config: ProxyConfig, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<Self> {
        let cert_cache = Arc::new(CertificateCache::new(
            config.ca.clone(),
            config.cache_leaves,
        ));
        let connector = create_tls_connector(config.ignore_unauthorized, &config.extra_roots)?;

        let main_tls = match &config.https_hostname {
            Some(hostname) => {
                let key = cert_cache.get_or_issue(hostname)?;
                Some(TlsAcceptor::from(server_config_for(key)))
            }
            None => None,
        };

        let state = Arc::new_cyclic(|weak: &Weak<ProxyState>| {
            let weak = weak.clone();
            let handler: DecryptedHandler = Arc::new(move |tls, peer| {
                if let Some(state) = weak.upgrade() {
                    let tasks = state.tasks.clone();
                    tasks.spawn(serve_connection(tls, state, true, peer));
                }
            });

            ProxyState {
                hooks: config.hooks.clone(),
                recorder: config.recorder.clone(),
                registry: Arc::new(ConnectionRegistry::new()),
                termination: TerminationManager::new(cert_cache.clone(), handler),
                connector,
                throttle: config.throttle.clone(),
                force_intercept: config.force_intercept,
                ws_intercept: config.ws_intercept,
                chunk_threshold: config.chunk_threshold,
                upstream_timeout: config.upstream_timeout,
                drain_timeout: config.drain_timeout,
                local_port: OnceLock::new(),
                tasks: TaskTracker::new(),
                shutdown_rx: shutdown_rx.clone(),
            }
        });

        Ok(Self {
            config,
            shutdown_rx,
            cert_cache,
            main_tls,
            state,
        })
    }

    /// Registry of live CONNECT tunnels.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.state.registry.clone()
    }

    /// Get a reference to the certificate cache.
    pub fn cert_cache(&self) -> Arc<CertificateCache> {
        self.cert_cache.clone()
    }

    /// Shared state, including the termination listeners.
    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }

    /// Port the main listener is bound to, once running.
    pub fn local_port(&self) -> Option<u16> {
        self.state.local_port.get().copied()
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(self) -> ProxyResult<()> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        self.run_with_listener(listener).await
    }

    /// Run on an already-bound listener until shutdown.
    ///
    /// On shutdown every registered tunnel is torn down and every
    /// termination listener closed. Open connections get the drain timeout
    /// to finish.
    pub async fn run_with_listener(self, listener: TcpListener) -> ProxyResult<()> {
        let local = listener.local_addr()?;
        let _ = self.state.local_port.set(local.port());

        let scheme = if self.main_tls.is_some() { "https" } else { "http" };
        info!("Proxy listening on {}://{}", scheme, local);
        info!("Rules: {}", self.state.hooks.summary());

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream, peer);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Proxy shutting down");
                    break;
                }
            }
        }

        let torn_down = self.state.registry.close_all();
        self.state.termination.close(None).await;

        let tasks = &self.state.tasks;
        tasks.close();
        if tokio::time::timeout(self.state.drain_timeout, tasks.wait())
            .await
            .is_err()
        {
            warn!("{} connection task(s) still running after drain timeout", tasks.len());
        }
        info!("Proxy stopped ({} tunnels torn down)", torn_down);
        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let state = self.state.clone();
        match &self.main_tls {
            None => {
                self.state.tasks.spawn(serve_connection(stream, state, false, peer));
            }
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                self.state.tasks.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => serve_connection(tls, state, true, peer).await,
                        Err(e) => debug!("TLS handshake from {} failed: {}", peer, e),
                    }
                });
            }
        }
    }
}

/// Resolve once the shutdown flag is set. A dropped sender never resolves.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Serve HTTP/1.1 on one client connection.
async fn serve_connection<IO>(io: IO, state: Arc<ProxyState>, tls: bool, peer: SocketAddr)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service_state = state.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = service_state.clone();
        async move { proxy_request(req, state, tls).await }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT and WebSocket)
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    let mut conn = std::pin::pin!(conn);

    let mut shutdown_rx = state.shutdown_rx.clone();
    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(state.drain_timeout, conn.as_mut()).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Connection from {} did not drain in time", peer);
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = result {
        // Don't log connection resets as errors - they're common
        let err = ProxyError::from(e);
        if err.is_connection_reset() {
            debug!("Connection from {} ended: {}", peer, err);
        } else {
            warn!("Connection error from {}: {}", peer, err);
        }
    }
}

/// Process a single proxy request.
async fn proxy_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    tls: bool,
) -> ProxyResult<Response<ProxyBody>> {
    if req.method() == Method::CONNECT {
        handle_connect(req, state).await
    } else if is_websocket_upgrade(&req) {
        handle_websocket(req, state, tls).await
    } else {
        handle_http(req, state, tls).await
    }
}

/// Builder for ProxyServer configuration.
pub struct ProxyServerBuilder {
    bind_address: IpAddr,
    port: u16,
    https_hostname: Option<String>,
    ca: Option<Arc<RootAuthority>>,
    force_intercept: bool,
    ws_intercept: bool,
    ignore_unauthorized: bool,
    throttle: Option<Throttle>,
    chunk_threshold: usize,
    upstream_timeout: Duration,
    drain_timeout: Duration,
    cache_leaves: bool,
    extra_roots: Vec<CertificateDer<'static>>,
    hooks: Hooks,
    recorder: RecorderHandle,
}

impl ProxyServerBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            https_hostname: None,
            ca: None,
            force_intercept: false,
            ws_intercept: false,
            ignore_unauthorized: false,
            throttle: None,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            cache_leaves: false,
            extra_roots: Vec::new(),
            hooks: Hooks::default(),
            recorder: RecorderHandle::disabled(),
        }
    }

    /// Set the bind address.
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the main port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Serve the main port over HTTPS as `hostname`.
    pub fn https(mut self, hostname: impl Into<String>) -> Self {
        self.https_hostname = Some(hostname.into());
        self
    }

    /// Set the root authority.
    pub fn ca(mut self, ca: Arc<RootAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Intercept tunnels unless a rule says otherwise.
    pub fn force_intercept(mut self, enabled: bool) -> Self {
        self.force_intercept = enabled;
        self
    }

    /// Route plaintext WebSocket tunnels through the pipeline.
    pub fn ws_intercept(mut self, enabled: bool) -> Self {
        self.ws_intercept = enabled;
        self
    }

    /// Skip upstream certificate verification.
    pub fn ignore_unauthorized(mut self, enabled: bool) -> Self {
        self.ignore_unauthorized = enabled;
        self
    }

    /// Set the bandwidth throttle.
    pub fn throttle(mut self, throttle: Option<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set the streaming threshold in bytes.
    pub fn chunk_threshold(mut self, bytes: usize) -> Self {
        self.chunk_threshold = bytes;
        self
    }

    /// Set the upstream timeout.
    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Cache issued leaves.
    pub fn cache_leaves(mut self, enabled: bool) -> Self {
        self.cache_leaves = enabled;
        self
    }

    /// Trust an additional root for upstream TLS.
    pub fn trust_root(mut self, root: CertificateDer<'static>) -> Self {
        self.extra_roots.push(root);
        self
    }

    /// Set the interception rules.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the recorder.
    pub fn recorder(mut self, recorder: RecorderHandle) -> Self {
        self.recorder = recorder;
        self
    }

    /// Build the proxy server.
    ///
    /// # Arguments
    ///
    /// * `shutdown_rx` - Receiver for shutdown signal.
    ///
    /// # Errors
    ///
    /// Fails if no root authority was set or the TLS setup fails.
    pub fn build(self, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<ProxyServer> {
        let ca = self
            .ca
            .ok_or_else(|| ProxyError::Config("a root authority is required".into()))?;

        let config = ProxyConfig {
            bind_address: self.bind_address,
            port: self.port,
            https_hostname: self.https_hostname,
            ca,
            force_intercept: self.force_intercept,
            ws_intercept: self.ws_intercept,
            ignore_unauthorized: self.ignore_unauthorized,
            throttle: self.throttle,
            chunk_threshold: self.chunk_threshold,
            upstream_timeout: self.upstream_timeout,
            drain_timeout: self.drain_timeout,
            cache_leaves: self.cache_leaves,
            extra_roots: self.extra_roots,
            hooks: self.hooks,
            recorder: self.recorder,
        };

        ProxyServer::new(config, shutdown_rx)
    }
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
