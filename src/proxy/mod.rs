//! Man-in-the-middle forward proxy.
//!
//! This module provides the proxy itself:
//! - HTTP CONNECT handling with per-tunnel interception decisions
//! - TLS termination on ephemeral local endpoints with forged leaves
//! - A request/response pipeline with rule hooks, decoding and recording
//! - A WebSocket bridge with message queuing and close normalization
//! - Bandwidth throttling and a registry of live tunnels
//!
//! # Architecture
//!
//! ```text
//!  client ──CONNECT──▶ main port ──bypass────────────────────────▶ origin
//!                         │
//!                         ├─intercept─▶ termination endpoint (TLS)
//!                         │                    │
//!                         ▼                    ▼
//!                    HTTP pipeline ◀───── decrypted HTTP/1.1
//!                         │
//!                 rules ──┤── recorder
//!                         ▼
//!                      origin
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eden_proxy::ca::RootAuthority;
//! use eden_proxy::proxy::ProxyServerBuilder;
//! use std::sync::Arc;
//!
//! let ca = Arc::new(RootAuthority::load_or_generate(&dir)?);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServerBuilder::new().port(8001).ca(ca).build(shutdown_rx)?;
//! server.run().await?;
//! ```

pub mod body;
pub mod connect;
pub mod decompress;
pub mod error;
pub mod error_page;
pub mod hooks;
pub mod http;
pub mod peek;
pub mod registry;
pub mod server;
pub mod termination;
pub mod throttle;
pub mod tls;
pub mod upstream;
pub mod websocket;

// Re-export main types for convenient access
pub use body::ProxyBody;
pub use connect::{TunnelRoute, TunnelState};
pub use error::{ProxyError, ProxyResult};
pub use hooks::{
    ConnectDetail, DefaultRules, Hooks, Protocol, RequestContext, RequestOptions, RequestOverride,
    ResponseDetail, RuleHooks,
};
pub use registry::{ConnectionRegistry, TunnelInfo};
pub use server::{ProxyConfig, ProxyServer, ProxyServerBuilder, ProxyState};
pub use termination::{EndpointInfo, TerminationManager};
pub use throttle::Throttle;
pub use tls::{CertificateCache, create_tls_connector};
