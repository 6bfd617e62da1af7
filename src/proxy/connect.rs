//! HTTP CONNECT method handling.
//!
//! The flow for `CONNECT host:port HTTP/1.1`:
//!
//! 1. Parse the target; a malformed target is answered with `400`
//! 2. Ask the rules whether to intercept (`before_deal_https_request`),
//!    falling back to the configured force-intercept flag
//! 3. Answer `200` and upgrade, before anything is dialed
//! 4. Peek at the first chunk the client sends:
//!    - `GET ` is plaintext (bare HTTP or a WebSocket upgrade) and is never
//!      TLS-terminated; with WebSocket interception it goes to the local
//!      main port instead of the origin
//!    - anything else is treated as TLS
//! 5. Dial the origin (bypass), the local main port, or a termination
//!    endpoint, and splice the two sockets together
//!
//! Dial failures are reported to `on_connect_error` and answered with a raw
//! `502` written into the tunnel. Nothing propagates past the handler.

use super::body::{ProxyBody, empty_body, full_body};
use super::error::{ProxyError, ProxyResult};
use super::hooks::{ConnectDetail, Protocol};
use super::peek::{is_plain_get, request_path, sniff};
use super::server::ProxyState;
use super::throttle::{Throttle, copy_throttled};
use super::upstream::{dial, format_addr, split_host_port};
use crate::recorder::{RecordedBody, ResourceInfo};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Requests whose path starts with this are never marked for WebSocket interception.
pub const WS_BYPASS_SENTINEL: &str = "/do-not-proxy";

const LOOPBACK: &str = "127.0.0.1";

/// Lifecycle of a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// CONNECT request received and parsed.
    Received,
    /// Interception decided.
    Decision,
    /// `200` sent, waiting for the upgrade.
    AckSent,
    /// Reading the first client chunk.
    Sniffing,
    /// Outbound socket connected.
    Dialed,
    /// Splicing bytes both ways.
    Piping,
    /// Ended normally.
    Closed,
    /// Ended with an error.
    Error,
}

/// Where a tunnel's bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRoute {
    /// Straight to the origin, untouched.
    Bypass,
    /// To the proxy's own main port.
    LocalServer,
    /// To a TLS termination endpoint.
    Terminate,
}

/// Tracks a tunnel's state for logging.
struct Tunnel {
    target: String,
    state: TunnelState,
}

impl Tunnel {
    fn new(target: String, state: TunnelState) -> Self {
        Self { target, state }
    }

    fn enter(&mut self, next: TunnelState) {
        trace!("Tunnel {}: {:?} -> {:?}", self.target, self.state, next);
        self.state = next;
    }
}

/// Handle an HTTP CONNECT request.
pub async fn handle_connect(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> ProxyResult<Response<ProxyBody>> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let (host, port) = match parse_host_port(&authority) {
        Ok(target) => target,
        Err(e) => {
            warn!("Rejecting CONNECT: {}", e);
            return Ok(bad_request(&e.to_string()));
        }
    };

    let target = format_addr(&host, port);
    let mut tunnel = Tunnel::new(target.clone(), TunnelState::Received);
    debug!("CONNECT request to {}", target);

    let detail = ConnectDetail {
        host,
        port,
        headers: req.headers().clone(),
    };

    let verdict = state.hooks.before_deal_https_request(&detail).await;
    let intercept = decide_intercept(verdict, state.force_intercept);
    tunnel.enter(TunnelState::Decision);
    debug!("Tunnel {} intercept={}", target, intercept);

    let tasks = state.tasks.clone();
    tasks.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                run_tunnel(TokioIo::new(upgraded), detail, intercept, tunnel, state).await;
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", target, e);
            }
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// Resolve the interception decision. A rule verdict wins over the flag.
pub fn decide_intercept(verdict: Option<bool>, force_intercept: bool) -> bool {
    verdict.unwrap_or(force_intercept)
}

/// Pick the route for a tunnel from its first chunk.
///
/// A plain `GET` is plaintext HTTP or WebSocket and always goes through the
/// local pipeline, never to TLS termination or straight to the origin.
pub fn choose_route(intercept: bool, first_chunk: &[u8]) -> TunnelRoute {
    if is_plain_get(first_chunk) {
        TunnelRoute::LocalServer
    } else if intercept {
        TunnelRoute::Terminate
    } else {
        TunnelRoute::Bypass
    }
}

/// Whether a plain `GET` tunnel is marked for WebSocket interception.
pub fn ws_intercept_marked(first_chunk: &[u8], ws_intercept: bool) -> bool {
    ws_intercept
        && is_plain_get(first_chunk)
        && !request_path(first_chunk).is_some_and(|p| p.starts_with(WS_BYPASS_SENTINEL))
}

/// Port dialed on the bypass route. Port 80 is promoted to 443.
pub fn bypass_port(port: u16) -> u16 {
    if port == 80 { 443 } else { port }
}

async fn run_tunnel<IO>(
    client: IO,
    detail: ConnectDetail,
    intercept: bool,
    mut tunnel: Tunnel,
    state: Arc<ProxyState>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tunnel.enter(TunnelState::AckSent);
    tunnel.enter(TunnelState::Sniffing);

    let (mut client, first) = match sniff(client).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            tunnel.enter(TunnelState::Error);
            debug!("Client socket error on {}: {}", tunnel.target, e);
            state
                .hooks
                .on_client_socket_error(&detail, &ProxyError::Io(e))
                .await;
            return;
        }
    };

    if first.is_empty() {
        debug!("Client closed tunnel {} before sending data", tunnel.target);
        tunnel.enter(TunnelState::Closed);
        return;
    }

    let route = choose_route(intercept, &first);
    debug!(
        "Tunnel {} routed {:?} (ws intercept: {})",
        tunnel.target,
        route,
        ws_intercept_marked(&first, state.ws_intercept)
    );

    let upstream = match dial_route(route, &detail, &state).await {
        Ok(stream) => stream,
        Err(err) => {
            tunnel.enter(TunnelState::Error);
            warn!("Tunnel to {} failed: {}", tunnel.target, err);
            state.hooks.on_connect_error(&detail, &err).await;
            let _ = client.write_all(bad_gateway_head(&err).as_bytes()).await;
            let _ = client.shutdown().await;
            return;
        }
    };
    tunnel.enter(TunnelState::Dialed);

    record_tunnel(&detail, &state);
    let mut registration = state.registry.register(tunnel.target.clone());

    let throttle = match route {
        TunnelRoute::Bypass => state.throttle.clone(),
        _ => None,
    };

    tunnel.enter(TunnelState::Piping);
    tokio::select! {
        result = pipe(client, upstream, throttle) => match result {
            Ok((sent, received)) => {
                debug!("Tunnel {} closed ({} bytes up, {} down)", tunnel.target, sent, received);
                tunnel.enter(TunnelState::Closed);
            }
            Err(e) => {
                debug!("Tunnel {} ended: {}", tunnel.target, e);
                tunnel.enter(TunnelState::Error);
            }
        },
        _ = registration.torn_down() => {
            info!("Tunnel {} torn down", tunnel.target);
            tunnel.enter(TunnelState::Closed);
        }
    }
}

async fn dial_route(
    route: TunnelRoute,
    detail: &ConnectDetail,
    state: &ProxyState,
) -> ProxyResult<TcpStream> {
    match route {
        TunnelRoute::Bypass => {
            dial(&detail.host, bypass_port(detail.port), state.upstream_timeout).await
        }
        TunnelRoute::LocalServer => {
            let port = state
                .local_port
                .get()
                .copied()
                .ok_or_else(|| ProxyError::Config("main port is not bound yet".into()))?;
            dial(LOOPBACK, port, state.upstream_timeout).await
        }
        TunnelRoute::Terminate => {
            let endpoint = state.termination.get_or_create_endpoint(&detail.host).await?;
            dial(LOOPBACK, endpoint.port, state.upstream_timeout).await
        }
    }
}

async fn pipe<C, U>(mut client: C, mut upstream: U, throttle: Option<Throttle>) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let Some(throttle) = throttle else {
        return tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    };

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
        upstream_write.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let upstream_to_client = copy_throttled(&mut upstream_read, &mut client_write, &throttle);

    tokio::try_join!(client_to_upstream, upstream_to_client)
}

fn record_tunnel(detail: &ConnectDetail, state: &ProxyState) {
    let mut info = ResourceInfo::started(
        Protocol::Https,
        "CONNECT",
        &detail.host,
        "",
        &format!("https://{}", detail.host),
        &detail.headers,
    );
    info.finish(200, &HeaderMap::new(), RecordedBody::Empty);
    state.recorder.append(&info);
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
fn parse_host_port(authority: &str) -> ProxyResult<(String, u16)> {
    split_host_port(authority, 443)
        .ok_or_else(|| ProxyError::ProtocolSniff(format!("'{}' is not host:port", authority)))
}

/// Raw response head written into a tunnel whose dial failed.
fn bad_gateway_head(err: &ProxyError) -> String {
    format!(
        "HTTP/1.1 502\r\nProxy-Error: true\r\nProxy-Error-Message: {}\r\nContent-Type: text/html\r\n\r\n",
        header_safe(&err.to_string())
    )
}

/// Replace characters that cannot appear in a header value.
pub(crate) fn header_safe(text: &str) -> String {
    text.chars()
        .map(|c| if c == ' ' || c.is_ascii_graphic() { c } else { ' ' })
        .collect()
}

fn bad_request(message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    const TLS_HELLO: &[u8] = &[0x16, 0x03, 0x01, 0x00, 0xa5, 0x01];

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("api.example.com:443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_custom_port() {
        let (host, port) = parse_host_port("api.example.com:8443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("api.example.com").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_invalid_port() {
        let result = parse_host_port("api.example.com:invalid");
        assert!(matches!(result, Err(ProxyError::ProtocolSniff(_))));
        assert!(parse_host_port("").is_err());
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        let (host, port) = parse_host_port("[::1]:443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_decide_intercept() {
        assert!(decide_intercept(None, true));
        assert!(!decide_intercept(None, false));
        assert!(decide_intercept(Some(true), false));
        assert!(!decide_intercept(Some(false), true));
    }

    #[test]
    fn test_plain_get_goes_to_local_server() {
        let get = b"GET /chat HTTP/1.1\r\nHost: a.test\r\n\r\n";
        assert_eq!(choose_route(true, get), TunnelRoute::LocalServer);
        assert_eq!(choose_route(false, get), TunnelRoute::LocalServer);

        let sentinel = b"GET /do-not-proxy/socket HTTP/1.1\r\n\r\n";
        assert_eq!(choose_route(false, sentinel), TunnelRoute::LocalServer);
    }

    #[test]
    fn test_ws_intercept_marking() {
        let get = b"GET /chat HTTP/1.1\r\n\r\n";
        assert!(ws_intercept_marked(get, true));
        assert!(!ws_intercept_marked(get, false));
        assert!(!ws_intercept_marked(b"GET /do-not-proxy/socket HTTP/1.1\r\n\r\n", true));
        assert!(!ws_intercept_marked(TLS_HELLO, true));
    }

    #[test]
    fn test_non_get_treated_as_tls() {
        assert_eq!(choose_route(true, TLS_HELLO), TunnelRoute::Terminate);
        assert_eq!(choose_route(false, TLS_HELLO), TunnelRoute::Bypass);
        assert_eq!(choose_route(true, b"garbage"), TunnelRoute::Terminate);
    }

    #[test]
    fn test_bypass_port() {
        assert_eq!(bypass_port(80), 443);
        assert_eq!(bypass_port(443), 443);
        assert_eq!(bypass_port(8080), 8080);
    }

    #[test]
    fn test_bad_gateway_head() {
        let err = ProxyError::UpstreamConnect {
            addr: "a.test:443".to_string(),
            message: "refused\r\nInjected: yes".to_string(),
        };
        let head = bad_gateway_head(&err);
        assert!(head.starts_with("HTTP/1.1 502\r\nProxy-Error: true\r\n"));
        assert!(head.ends_with("Content-Type: text/html\r\n\r\n"));
        assert!(!head.contains("\r\nInjected"));
    }

    #[test]
    fn test_bad_request_response() {
        let response = bad_request("nope");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
