//! WebSocket bridge.
//!
//! The client handshake is answered locally with `101`; the upstream
//! handshake is made separately, after the rules have had a chance to
//! rewrite the target. Client messages that arrive before the upstream is
//! open are queued and flushed in order.
//!
//! Abnormal close codes (1004-1006) are rewritten to a normal 1000 with a
//! reason naming the original code, so clients see an orderly close when the
//! origin drops.

use super::body::{ProxyBody, empty_body, full_body};
use super::error::{ProxyError, ProxyResult};
use super::hooks::{Protocol, RequestContext, RequestOptions};
use super::http::{INTERNAL_HEADER, request_target};
use super::server::ProxyState;
use super::upstream::{UpstreamStream, connect_upstream};
use crate::recorder::{RecordId, RecordedBody, RecorderHandle, ResourceInfo, SKIP_RECORD, WsMessage};
use bytes::Bytes;
use futures_util::future::{self, Either};
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{
    CONNECTION, HOST, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::client::{Response as UpstreamHandshake, generate_key};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, client_async};
use tracing::{debug, info, warn};

/// Marks responses to WebSocket handshakes answered by the proxy.
pub const WEBSOCKET_MARKER_HEADER: &str = "x-eden-proxy-websocket";

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

/// Longest close reason that fits a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// Client messages held while the upstream handshake is in flight.
const CLIENT_QUEUE_CAPACITY: usize = 64;

/// How long the second direction gets to finish once the first has closed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Whether `req` asks to upgrade to WebSocket.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    req.method() == Method::GET && upgrade && connection
}

/// Rewrite abnormal close codes to a normal close that names them.
pub fn normalize_close(code: u16, reason: &str) -> (u16, String) {
    if (1004..=CLOSE_ABNORMAL).contains(&code) {
        let reason = format!(
            "Normally closed. The origin ws is closed at code: {} and reason: {}",
            code, reason
        );
        (CLOSE_NORMAL, truncate_reason(reason))
    } else {
        (code, truncate_reason(reason.to_string()))
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Accept a WebSocket upgrade and bridge it to the origin.
pub async fn handle_websocket(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    tls: bool,
) -> ProxyResult<Response<ProxyBody>> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
        return Ok(bad_request("missing Sec-WebSocket-Key"));
    };
    let target = match request_target(&req, tls) {
        Ok(target) => target,
        Err(e) => return Ok(bad_request(&e.to_string())),
    };

    let protocol = if target.protocol.is_secure() {
        Protocol::Wss
    } else {
        Protocol::Ws
    };
    let subprotocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();

    let mut headers = req.headers().clone();
    strip_handshake_headers(&mut headers);

    let mut ctx = RequestContext {
        protocol,
        url: format!("{}://{}{}", protocol, target.authority, target.path),
        request_options: RequestOptions {
            hostname: target.hostname,
            port: target.port,
            path: target.path,
            method: Method::GET,
            headers,
        },
        request_data: Bytes::new(),
        response: None,
    };
    if let Some(update) = state.hooks.before_send_request(&ctx).await {
        ctx.merge(update);
    }
    ctx.protocol = if ctx.protocol.is_secure() {
        Protocol::Wss
    } else {
        Protocol::Ws
    };

    let upstream_url = ctx.target_url();
    let info = ResourceInfo::started(
        ctx.protocol,
        "WebSocket",
        &target.authority,
        &ctx.request_options.path,
        &upstream_url,
        req.headers(),
    );
    let record_id = if req.headers().contains_key(INTERNAL_HEADER) {
        SKIP_RECORD
    } else {
        state.recorder.append(&info)
    };

    info!("WebSocket {} -> {}", ctx.url, upstream_url);

    let session_subprotocol = subprotocol.clone();
    let tasks = state.tasks.clone();
    tasks.spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let session = Session {
                    ctx,
                    subprotocol: session_subprotocol,
                    record_id,
                    info,
                    state,
                };
                session.bridge(TokioIo::new(upgraded)).await;
            }
            Err(e) => warn!("WebSocket upgrade failed for {}: {}", upstream_url, e),
        }
    });

    let accept = derive_accept_key(key.as_bytes());
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&accept).map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?,
    );
    if let Some(subprotocol) = subprotocol {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, subprotocol);
    }
    headers.insert(
        HeaderName::from_static(WEBSOCKET_MARKER_HEADER),
        HeaderValue::from_static("true"),
    );
    Ok(response)
}

/// Drop headers owned by the handshake; the upstream handshake sets its own.
fn strip_handshake_headers(headers: &mut HeaderMap) {
    let handshake: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("sec-websocket-"))
        .cloned()
        .collect();
    for name in handshake {
        headers.remove(&name);
    }
    headers.remove(CONNECTION);
    headers.remove(UPGRADE);
    headers.remove("proxy-connection");
}

struct Session {
    ctx: RequestContext,
    subprotocol: Option<HeaderValue>,
    record_id: RecordId,
    info: ResourceInfo,
    state: Arc<ProxyState>,
}

impl Session {
    async fn bridge<IO>(mut self, client_io: IO)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let url = self.ctx.target_url();
        let client = WebSocketStream::from_raw_socket(client_io, Role::Server, None).await;
        let (mut client_tx, mut client_rx) = client.split();

        // Client messages are read (and recorded) from the start, then
        // queued until the upstream handshake completes.
        let (queue_tx, mut queue_rx) = mpsc::channel::<Message>(CLIENT_QUEUE_CAPACITY);
        let recorder = self.state.recorder.clone();
        let record_id = self.record_id;
        let reader = tokio::spawn(async move {
            loop {
                let message = match client_rx.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("WebSocket client read failed: {}", e);
                        let _ = queue_tx.send(close_message(CLOSE_ABNORMAL, "")).await;
                        break;
                    }
                    None => {
                        let _ = queue_tx.send(close_message(CLOSE_ABNORMAL, "")).await;
                        break;
                    }
                };
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        record_message(&recorder, record_id, true, &message);
                        if queue_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        let (code, reason) = close_parts(frame);
                        let _ = queue_tx.send(close_message(code, &reason)).await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        let upstream = match self.connect_upstream().await {
            Ok((upstream, handshake)) => {
                self.info
                    .finish(handshake.status().as_u16(), handshake.headers(), RecordedBody::Empty);
                self.state.recorder.update(self.record_id, &self.info);
                upstream
            }
            Err(e) => {
                warn!("WebSocket upstream {} failed: {}", url, e);
                self.info.finish(
                    StatusCode::BAD_GATEWAY.as_u16(),
                    &HeaderMap::new(),
                    RecordedBody::Empty,
                );
                self.state.recorder.update(self.record_id, &self.info);
                reader.abort();
                let _ = client_tx
                    .send(raw_close(CLOSE_GOING_AWAY, truncate_reason(e.to_string())))
                    .await;
                return;
            }
        };
        debug!("WebSocket upstream {} open", url);

        let (mut upstream_tx, mut upstream_rx) = upstream.split();
        let recorder = &self.state.recorder;

        let to_upstream = async {
            while let Some(message) = queue_rx.recv().await {
                let closing = message.is_close();
                if let Err(e) = upstream_tx.send(message).await {
                    debug!("WebSocket send to {} failed: {}", url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        };

        let to_client = async {
            loop {
                let message = match upstream_rx.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) if !is_transport_drop(&e) => {
                        warn!("WebSocket relay from {} failed: {}", url, e);
                        let _ = client_tx.send(raw_close(CLOSE_GOING_AWAY, String::new())).await;
                        break;
                    }
                    _ => {
                        debug!("WebSocket upstream {} dropped", url);
                        let _ = client_tx.send(close_message(CLOSE_ABNORMAL, "")).await;
                        break;
                    }
                };
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        record_message(recorder, record_id, false, &message);
                        if client_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        let (code, reason) = close_parts(frame);
                        let _ = client_tx.send(close_message(code, &reason)).await;
                        break;
                    }
                    _ => {}
                }
            }
        };

        let to_upstream = std::pin::pin!(to_upstream);
        let to_client = std::pin::pin!(to_client);
        match future::select(to_upstream, to_client).await {
            Either::Left(((), pending)) => {
                let _ = tokio::time::timeout(CLOSE_GRACE, pending).await;
            }
            Either::Right(((), pending)) => {
                let _ = tokio::time::timeout(CLOSE_GRACE, pending).await;
            }
        }

        reader.abort();
        debug!("WebSocket session {} closed", url);
    }

    async fn connect_upstream(
        &self,
    ) -> ProxyResult<(WebSocketStream<UpstreamStream>, UpstreamHandshake)> {
        let options = &self.ctx.request_options;
        let stream = connect_upstream(
            &options.hostname,
            options.port,
            self.ctx.protocol.is_secure(),
            &self.state.connector,
            self.state.upstream_timeout,
        )
        .await?;

        let mut request = Request::new(());
        *request.uri_mut() = self
            .ctx
            .target_url()
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad WebSocket URL: {}", e)))?;
        *request.headers_mut() = options.headers.clone();

        let headers = request.headers_mut();
        if !headers.contains_key(HOST)
            && let Some(authority) = request_authority(&self.ctx)
        {
            headers.insert(HOST, authority);
        }
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&generate_key())
                .map_err(|e| ProxyError::WebSocket(e.to_string()))?,
        );
        if let Some(subprotocol) = &self.subprotocol {
            headers.insert(SEC_WEBSOCKET_PROTOCOL, subprotocol.clone());
        }

        let (ws, handshake) = tokio::time::timeout(
            self.state.upstream_timeout,
            client_async(request, stream),
        )
        .await
        .map_err(|_| ProxyError::Timeout(format!("WebSocket handshake with {}", options.hostname)))??;
        Ok((ws, handshake))
    }
}

fn request_authority(ctx: &RequestContext) -> Option<HeaderValue> {
    let uri: hyper::Uri = ctx.target_url().parse().ok()?;
    HeaderValue::from_str(uri.authority()?.as_str()).ok()
}

/// An upstream read error that just means the peer went away.
fn is_transport_drop(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

fn close_parts(frame: Option<CloseFrame>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
        None => (CLOSE_NO_STATUS, String::new()),
    }
}

/// A close frame carrying the normalized form of `code`.
fn close_message(code: u16, reason: &str) -> Message {
    let (code, reason) = normalize_close(code, reason);
    raw_close(code, reason)
}

fn raw_close(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

fn record_message(recorder: &RecorderHandle, id: RecordId, is_to_server: bool, message: &Message) {
    let entry = match message {
        Message::Text(text) => WsMessage::text(is_to_server, text.as_str()),
        Message::Binary(data) => WsMessage::binary(is_to_server, data.clone()),
        _ => return,
    };
    recorder.ws_message(id, &entry);
}

fn bad_request(message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
