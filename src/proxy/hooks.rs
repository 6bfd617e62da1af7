//! Rule hooks invoked at the interception decision points.
//!
//! A rule set implements [`RuleHooks`]; every method has a no-op default so
//! implementors override only what they need. The proxy calls hooks through
//! [`Hooks`], which logs hook failures and treats them as "no override".
//!
//! Hooks run in a fixed order for each exchange:
//!
//! 1. `before_deal_https_request` (once per CONNECT)
//! 2. `before_send_request`
//! 3. `before_send_response` (buffered, non-injected responses only)
//!
//! # Example
//!
//! ```ignore
//! use eden_proxy::proxy::hooks::{RequestContext, RequestOverride, RuleHooks};
//!
//! struct Rewrite;
//!
//! #[async_trait::async_trait]
//! impl RuleHooks for Rewrite {
//!     async fn before_send_request(
//!         &self,
//!         ctx: &RequestContext,
//!     ) -> anyhow::Result<Option<RequestOverride>> {
//!         let mut options = ctx.request_options.clone();
//!         options.path = "/v2".to_string() + &options.path;
//!         Ok(Some(RequestOverride { request_options: Some(options), ..Default::default() }))
//!     }
//! }
//! ```

use super::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Application protocol of an intercepted exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// Plain WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl Protocol {
    /// Scheme string as it appears in URLs.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    /// Whether the protocol runs over TLS.
    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Wss)
    }

    /// Port implied when a URL omits one.
    pub fn default_port(self) -> u16 {
        if self.is_secure() { 443 } else { 80 }
    }

    /// Parse a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "ws" => Some(Protocol::Ws),
            "wss" => Some(Protocol::Wss),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a request is sent upstream.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Target hostname.
    pub hostname: String,
    /// Target port.
    pub port: u16,
    /// Path including query string.
    pub path: String,
    /// Request method.
    pub method: Method,
    /// Request headers.
    pub headers: HeaderMap,
}

/// A response produced by the origin or by a hook.
#[derive(Debug, Clone, Default)]
pub struct ResponseDetail {
    /// Status code; required before the response can be sent.
    pub status_code: Option<StatusCode>,
    /// Response headers; required before the response can be sent.
    pub headers: Option<HeaderMap>,
    /// Fully buffered body.
    pub body: Bytes,
}

impl ResponseDetail {
    /// Build a complete response.
    pub fn new(status_code: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status_code: Some(status_code),
            headers: Some(headers),
            body: body.into(),
        }
    }
}

/// Everything the pipeline knows about an exchange before it is sent.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Protocol the request is sent with.
    pub protocol: Protocol,
    /// Full URL as received.
    pub url: String,
    /// Upstream target and request line.
    pub request_options: RequestOptions,
    /// Fully buffered request body.
    pub request_data: Bytes,
    /// Response injected by a hook; when set the origin is never contacted.
    pub response: Option<ResponseDetail>,
}

impl RequestContext {
    /// Apply a hook override field by field. Absent fields keep their value.
    pub fn merge(&mut self, update: RequestOverride) {
        if let Some(protocol) = update.protocol {
            self.protocol = protocol;
        }
        if let Some(options) = update.request_options {
            self.request_options = options;
        }
        if let Some(data) = update.request_data {
            self.request_data = data;
        }
        if update.response.is_some() {
            self.response = update.response;
        }
    }

    /// URL the request will actually be sent to, after overrides.
    pub fn target_url(&self) -> String {
        let options = &self.request_options;
        let host = if options.hostname.contains(':') {
            format!("[{}]", options.hostname)
        } else {
            options.hostname.clone()
        };
        if options.port == self.protocol.default_port() {
            format!("{}://{}{}", self.protocol, host, options.path)
        } else {
            format!("{}://{}:{}{}", self.protocol, host, options.port, options.path)
        }
    }
}

/// Partial update returned by [`RuleHooks::before_send_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOverride {
    /// Replacement protocol.
    pub protocol: Option<Protocol>,
    /// Replacement target and request line.
    pub request_options: Option<RequestOptions>,
    /// Replacement body.
    pub request_data: Option<Bytes>,
    /// Response to serve instead of contacting the origin.
    pub response: Option<ResponseDetail>,
}

/// A CONNECT request as seen by the tunnel handler.
#[derive(Debug, Clone)]
pub struct ConnectDetail {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Headers of the CONNECT request.
    pub headers: HeaderMap,
}

/// User-supplied interception policy.
///
/// All methods default to "do nothing". Errors are logged by the proxy and
/// treated exactly like `Ok(None)`.
#[async_trait]
pub trait RuleHooks: Send + Sync {
    /// Human-readable description logged at startup.
    fn summary(&self) -> String {
        String::new()
    }

    /// Decide whether a CONNECT tunnel is decrypted.
    ///
    /// `None` defers to the configured force-intercept flag.
    async fn before_deal_https_request(
        &self,
        _detail: &ConnectDetail,
    ) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }

    /// Rewrite the outgoing request or inject a response.
    async fn before_send_request(
        &self,
        _ctx: &RequestContext,
    ) -> anyhow::Result<Option<RequestOverride>> {
        Ok(None)
    }

    /// Replace the origin response before it is sent to the client.
    async fn before_send_response(
        &self,
        _ctx: &RequestContext,
        _response: &ResponseDetail,
    ) -> anyhow::Result<Option<ResponseDetail>> {
        Ok(None)
    }

    /// Produce a custom response for a failed exchange.
    ///
    /// Only used when the returned headers are non-empty.
    async fn on_error(
        &self,
        _ctx: &RequestContext,
        _error: &ProxyError,
    ) -> anyhow::Result<Option<ResponseDetail>> {
        Ok(None)
    }

    /// Observe an upstream dial failure inside a CONNECT tunnel.
    async fn on_connect_error(
        &self,
        _detail: &ConnectDetail,
        _error: &ProxyError,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe a client socket failure inside a CONNECT tunnel.
    async fn on_client_socket_error(
        &self,
        _detail: &ConnectDetail,
        _error: &ProxyError,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Rule set that never overrides anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRules;

impl RuleHooks for DefaultRules {}

/// Shared handle the proxy calls hooks through.
#[derive(Clone)]
pub struct Hooks {
    inner: Arc<dyn RuleHooks>,
}

impl Hooks {
    /// Wrap a rule set.
    pub fn new(rules: Arc<dyn RuleHooks>) -> Self {
        Self { inner: rules }
    }

    /// Description of the installed rule set.
    pub fn summary(&self) -> String {
        self.inner.summary()
    }

    /// See [`RuleHooks::before_deal_https_request`].
    pub async fn before_deal_https_request(&self, detail: &ConnectDetail) -> Option<bool> {
        log_failure(
            "before_deal_https_request",
            self.inner.before_deal_https_request(detail).await,
        )
        .flatten()
    }

    /// See [`RuleHooks::before_send_request`].
    pub async fn before_send_request(&self, ctx: &RequestContext) -> Option<RequestOverride> {
        log_failure(
            "before_send_request",
            self.inner.before_send_request(ctx).await,
        )
        .flatten()
    }

    /// See [`RuleHooks::before_send_response`].
    pub async fn before_send_response(
        &self,
        ctx: &RequestContext,
        response: &ResponseDetail,
    ) -> Option<ResponseDetail> {
        log_failure(
            "before_send_response",
            self.inner.before_send_response(ctx, response).await,
        )
        .flatten()
    }

    /// See [`RuleHooks::on_error`].
    pub async fn on_error(&self, ctx: &RequestContext, err: &ProxyError) -> Option<ResponseDetail> {
        log_failure("on_error", self.inner.on_error(ctx, err).await).flatten()
    }

    /// See [`RuleHooks::on_connect_error`].
    pub async fn on_connect_error(&self, detail: &ConnectDetail, err: &ProxyError) {
        log_failure("on_connect_error", self.inner.on_connect_error(detail, err).await);
    }

    /// See [`RuleHooks::on_client_socket_error`].
    pub async fn on_client_socket_error(&self, detail: &ConnectDetail, err: &ProxyError) {
        log_failure(
            "on_client_socket_error",
            self.inner.on_client_socket_error(detail, err).await,
        );
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new(Arc::new(DefaultRules))
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("summary", &self.inner.summary())
            .finish()
    }
}

fn log_failure<T>(hook: &str, result: anyhow::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Rule hook {} failed: {:#}", hook, e);
            None
        }
    }
}
