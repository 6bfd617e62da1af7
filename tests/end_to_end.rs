use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eden_proxy::ca::RootAuthority;
use eden_proxy::proxy::{
    ProxyServerBuilder, RequestContext, RequestOverride, ResponseDetail, RuleHooks,
};
use eden_proxy::proxy::hooks::Hooks;
use eden_proxy::proxy::tls::{certified_key_from_leaf, server_config_for};
use eden_proxy::recorder::{MemoryRecorder, RecordedBody, RecorderHandle, WsPayload};
use futures_util::{SinkExt, StreamExt};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const TIMEOUT: Duration = Duration::from_secs(10);

struct RunningProxy {
    addr: SocketAddr,
    recorder: Arc<MemoryRecorder>,
    ca: Arc<RootAuthority>,
    shutdown_tx: watch::Sender<bool>,
    _ca_dir: TempDir,
}

async fn start_proxy(configure: impl FnOnce(ProxyServerBuilder) -> ProxyServerBuilder) -> RunningProxy {
    let ca_dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(RootAuthority::generate(ca_dir.path(), false).unwrap());
    let recorder = Arc::new(MemoryRecorder::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let builder = ProxyServerBuilder::new()
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .ca(ca.clone())
        .upstream_timeout(Duration::from_secs(5))
        .recorder(RecorderHandle::new(recorder.clone()));
    let server = configure(builder).build(shutdown_rx).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run_with_listener(listener));

    RunningProxy {
        addr,
        recorder,
        ca,
        shutdown_tx,
        _ca_dir: ca_dir,
    }
}

/// Plain HTTP origin answering every request with `hello`.
async fn start_http_origin() -> SocketAddr {
    start_static_origin(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
            .to_vec(),
    )
    .await
}

/// Origin that reads one request head and answers with `response` verbatim.
async fn start_static_origin(response: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = Arc::new(response);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let response = response.clone();
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() {
                    return;
                }
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// Read up to the end of a request head.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    Some(head)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

async fn start_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Read until `needle` shows up or the stream ends.
async fn read_until_contains<S: AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    let read = async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.windows(needle.len()).any(|w| w == needle) {
                        break;
                    }
                }
            }
        }
    };
    tokio::time::timeout(TIMEOUT, read).await.unwrap();
    collected
}

async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "proxy closed during CONNECT");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {head}");
    stream
}

#[tokio::test]
async fn test_plain_http_forwarded_and_recorded() {
    let origin = start_http_origin().await;
    let proxy = start_proxy(|b| b).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{origin}/greeting?lang=en HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until_contains(&mut client, b"hello").await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.to_ascii_lowercase().contains("content-length: 5"));
    assert!(text.ends_with("hello"));

    // Recording completes after the body is handed to the client
    tokio::time::sleep(Duration::from_millis(200)).await;
    let records = proxy.recorder.records();
    let (_, info) = records
        .iter()
        .find(|(_, info)| info.path == "/greeting?lang=en")
        .expect("request was recorded");
    assert_eq!(info.method, "GET");
    assert_eq!(info.status_code, Some(200));
    assert_eq!(info.res_body, RecordedBody::Buffered("hello".into()));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unreachable_origin_gets_error_page() {
    let proxy = start_proxy(|b| b).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_contains(&mut client, b"</html>").await;
    let text = String::from_utf8_lossy(&response).to_ascii_lowercase();
    assert!(text.starts_with("http/1.1 500"), "got: {text}");
    assert!(text.contains("proxy-error: true"));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_bypass_tunnel_relays_bytes() {
    let origin = start_echo_origin().await;
    let proxy = start_proxy(|b| b).await;

    let mut tunnel = open_tunnel(proxy.addr, &origin.to_string()).await;
    tunnel.write_all(b"\x16not really tls").await.unwrap();

    let echoed = read_until_contains(&mut tunnel, b"tls").await;
    assert_eq!(echoed, b"\x16not really tls");

    let records = proxy.recorder.records();
    assert!(records.iter().any(|(_, info)| info.method == "CONNECT"));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_tunnel_dial_failure_returns_502_head() {
    let proxy = start_proxy(|b| b).await;

    let mut tunnel = open_tunnel(proxy.addr, "127.0.0.1:1").await;
    tunnel.write_all(b"\x16hello").await.unwrap();

    let reply = read_until_contains(&mut tunnel, b"\r\n\r\n").await;
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 502"), "got: {text}");
    assert!(text.contains("Proxy-Error: true"));

    let _ = proxy.shutdown_tx.send(true);
}

/// Answers every decrypted request itself.
struct InjectingRules;

#[async_trait]
impl RuleHooks for InjectingRules {
    fn summary(&self) -> String {
        "inject a canned response".to_string()
    }

    async fn before_send_request(
        &self,
        ctx: &RequestContext,
    ) -> anyhow::Result<Option<RequestOverride>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let body = format!("injected for {}", ctx.request_options.hostname);
        Ok(Some(RequestOverride {
            response: Some(ResponseDetail::new(StatusCode::OK, headers, body)),
            ..Default::default()
        }))
    }
}

#[tokio::test]
async fn test_intercepted_tunnel_presents_forged_leaf() {
    let proxy = start_proxy(|b| {
        b.force_intercept(true)
            .hooks(Hooks::new(Arc::new(InjectingRules)))
    })
    .await;

    let tunnel = open_tunnel(proxy.addr, "secure.test:443").await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy.ca.cert_der().clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls_pki_types::ServerName::try_from("secure.test").unwrap();

    let mut tls = tokio::time::timeout(TIMEOUT, connector.connect(server_name, tunnel))
        .await
        .unwrap()
        .expect("leaf chains to the root");

    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(san.value.general_names.iter().any(|name| matches!(
        name,
        x509_parser::extensions::GeneralName::DNSName("secure.test")
    )));

    tls.write_all(b"GET /account HTTP/1.1\r\nHost: secure.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_until_contains(&mut tls, b"injected for secure.test").await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let records = proxy.recorder.records();
    let (_, info) = records
        .iter()
        .find(|(_, info)| info.path == "/account")
        .expect("decrypted request was recorded");
    assert_eq!(info.url, "https://secure.test/account");

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_websocket_bridge_normalizes_upstream_drop() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = origin_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = origin_listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            assert_eq!(text.as_str(), "ping");
            ws.send(Message::text("pong")).await.unwrap();
        }
        // Drop without a close handshake
        drop(ws);
    });

    let proxy = start_proxy(|b| b).await;
    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut client, response) =
        tokio_tungstenite::client_async(format!("ws://{origin}/chat"), stream)
            .await
            .unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    client.send(Message::text("ping")).await.unwrap();

    let reply = tokio::time::timeout(TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::text("pong"));

    let closing = tokio::time::timeout(TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match closing {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert!(frame.reason.as_str().contains("1006"));
        }
        other => panic!("expected a close frame, got {other:?}"),
    }

    let records = proxy.recorder.records();
    let (id, info) = records
        .iter()
        .find(|(_, info)| info.method == "WebSocket")
        .expect("session was recorded");
    assert_eq!(info.url, format!("ws://{origin}/chat"));
    let messages = proxy.recorder.ws_messages(*id);
    assert!(messages.iter().any(|m| m.is_to_server
        && matches!(&m.payload, WsPayload::Text(t) if t == "ping")));
    assert!(messages.iter().any(|m| !m.is_to_server
        && matches!(&m.payload, WsPayload::Text(t) if t == "pong")));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_gzip_response_decoded_with_recomputed_length() {
    let plain = b"compressible compressible compressible body";
    let compressed = gzip(plain);
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    response.extend_from_slice(&compressed);
    let origin = start_static_origin(response).await;
    let proxy = start_proxy(|b| b).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request =
        format!("GET http://{origin}/packed HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until_contains(&mut client, b"body").await;
    let text = String::from_utf8_lossy(&response);
    let lower = text.to_ascii_lowercase();
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with("compressible compressible compressible body"));
    assert!(!lower.contains("content-encoding: gzip"));
    assert!(lower.contains(&format!("content-length: {}", plain.len())));
    assert!(lower.contains("x-eden-proxy-origin-content-encoding: gzip"));
    assert!(lower.contains(&format!(
        "x-eden-proxy-origin-content-length: {}",
        compressed.len()
    )));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_plain_get_over_port_80_tunnel_uses_local_pipeline() {
    let origin = start_http_origin().await;
    let proxy = start_proxy(|b| b).await;

    // Nothing listens on 443 here: only the local pipeline can answer,
    // following the Host header to the origin.
    let mut tunnel = open_tunnel(proxy.addr, "127.0.0.1:80").await;
    let request = format!("GET /through-tunnel HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
    tunnel.write_all(request.as_bytes()).await.unwrap();

    let response = read_until_contains(&mut tunnel, b"hello").await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with("hello"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let records = proxy.recorder.records();
    assert!(records
        .iter()
        .any(|(_, info)| info.method == "GET" && info.path == "/through-tunnel"));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_decrypted_request_relayed_to_tls_origin() {
    // The origin's leaf comes from a root the proxy does not trust
    let origin_ca_dir = tempfile::tempdir().unwrap();
    let origin_ca = RootAuthority::generate(origin_ca_dir.path(), false).unwrap();
    let origin_leaf = origin_ca.issue_leaf("127.0.0.1").unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config_for(
        certified_key_from_leaf(&origin_leaf).unwrap(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                if read_head(&mut tls).await.is_none() {
                    return;
                }
                let _ = tls
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret")
                    .await;
                let _ = tls.shutdown().await;
            });
        }
    });

    let proxy = start_proxy(|b| b.force_intercept(true).ignore_unauthorized(true)).await;
    let tunnel = open_tunnel(proxy.addr, &origin.to_string()).await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy.ca.cert_der().clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls_pki_types::ServerName::try_from("127.0.0.1").unwrap();

    let mut tls = tokio::time::timeout(TIMEOUT, connector.connect(server_name, tunnel))
        .await
        .unwrap()
        .expect("forged IP leaf chains to the root");

    let request = format!("GET /vault HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    let response = read_until_contains(&mut tls, b"secret").await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with("secret"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let records = proxy.recorder.records();
    let (_, info) = records
        .iter()
        .find(|(_, info)| info.path == "/vault")
        .expect("decrypted request was recorded");
    assert_eq!(info.url, format!("https://{origin}/vault"));
    assert_eq!(info.status_code, Some(200));

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_websocket_messages_queued_until_upstream_opens() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = origin_listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Vec<String>>();
    tokio::spawn(async move {
        let (stream, _) = origin_listener.accept().await.unwrap();
        // Hold the handshake while the client is already sending
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut seen = Vec::new();
        while seen.len() < 3 {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => seen.push(text.as_str().to_string()),
                Some(Ok(_)) => {}
                _ => break,
            }
        }
        let _ = seen_tx.send(seen);
        let _ = ws.close(None).await;
    });

    let proxy = start_proxy(|b| b).await;
    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut client, response) =
        tokio_tungstenite::client_async(format!("ws://{origin}/queue"), stream)
            .await
            .unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    for text in ["one", "two", "three"] {
        client.send(Message::text(text)).await.unwrap();
    }

    let seen = tokio::time::timeout(TIMEOUT, seen_rx).await.unwrap().unwrap();
    assert_eq!(seen, vec!["one", "two", "three"]);

    let _ = proxy.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_websocket_upstream_failure_finishes_record() {
    let proxy = start_proxy(|b| b).await;
    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut client, response) = tokio_tungstenite::client_async("ws://127.0.0.1:1/gone", stream)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    let closing = tokio::time::timeout(TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(closing, Message::Close(Some(_))), "got {closing:?}");

    let records = proxy.recorder.records();
    let (_, info) = records
        .iter()
        .find(|(_, info)| info.method == "WebSocket")
        .expect("session was recorded");
    assert_eq!(info.status_code, Some(502));
    assert!(info.end_time.is_some());

    let _ = proxy.shutdown_tx.send(true);
}
