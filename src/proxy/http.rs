//! HTTP request/response pipeline.
//!
//! Every plain or TLS-terminated HTTP request passes through here:
//! buffer the request, let the rules rewrite it, fetch from the origin (or
//! take an injected response), decode and let the rules rewrite the
//! response, then send it back and record the exchange.

use super::body::{ProxyBody, full_body, resume_body};
use super::connect::header_safe;
use super::decompress::decompress_response;
use super::error::{ProxyError, ProxyResult};
use super::error_page;
use super::hooks::{Protocol, RequestContext, RequestOptions, ResponseDetail};
use super::server::ProxyState;
use super::throttle::{Throttle, throttle_body};
use super::upstream::{connect_upstream, format_addr, split_host_port};
use crate::recorder::{RecordedBody, ResourceInfo, SKIP_RECORD};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING,
};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, warn};

/// Requests carrying this header are proxied but never recorded.
pub const INTERNAL_HEADER: &str = "x-eden-proxy-internal";

/// The origin's `connection` header is moved here.
pub const ORIGIN_CONNECTION: &str = "x-eden-proxy-origin-connection";

/// Where a request is going, reconstructed from the request line and `Host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub protocol: Protocol,
    pub authority: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub url: String,
}

/// Reconstruct the target of `req`. `tls` is whether the client connection
/// was TLS-terminated by the proxy.
pub(crate) fn request_target<B>(req: &Request<B>, tls: bool) -> ProxyResult<Target> {
    let uri = req.uri();
    let protocol = match uri.scheme_str() {
        Some(scheme) => match Protocol::from_scheme(scheme) {
            Some(p @ (Protocol::Http | Protocol::Https)) => p,
            _ => {
                return Err(ProxyError::InvalidRequest(format!(
                    "unsupported scheme '{}'",
                    scheme
                )));
            }
        },
        None if tls => Protocol::Https,
        None => Protocol::Http,
    };

    let authority = match uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    };
    let (hostname, port) = split_host_port(&authority, protocol.default_port())
        .ok_or_else(|| ProxyError::InvalidRequest(format!("no usable host in '{}'", authority)))?;

    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| p.starts_with('/'))
        .unwrap_or("/")
        .to_string();

    let url = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        format!("{}://{}{}", protocol, authority, path)
    };

    Ok(Target {
        protocol,
        authority,
        hostname,
        port,
        path,
        url,
    })
}

/// What the origin (or a rule) answered.
enum Fetched {
    /// Served by a rule; the origin was never contacted.
    Injected(ResponseDetail),
    /// Fully buffered origin response.
    Buffered(ResponseDetail),
    /// Origin response too large to buffer.
    Streamed(StreamedResponse),
}

struct StreamedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: ProxyBody,
}

/// A response ready to be sent to the client.
enum Outgoing {
    Buffered(ResponseDetail),
    Streamed(StreamedResponse),
}

/// Proxy one HTTP request.
pub async fn handle_http(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    tls: bool,
) -> ProxyResult<Response<ProxyBody>> {
    let target = match request_target(&req, tls) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting request {}: {}", req.uri(), e);
            return Ok(plain_response(StatusCode::BAD_REQUEST, e.to_string()));
        }
    };
    debug!("{} {}", req.method(), target.url);

    let (parts, body) = req.into_parts();
    let request_data = body.collect().await?.to_bytes();

    let mut info = ResourceInfo::started(
        target.protocol,
        parts.method.as_str(),
        &target.authority,
        &target.path,
        &target.url,
        &parts.headers,
    );
    let record_id = if parts.headers.contains_key(INTERNAL_HEADER) {
        SKIP_RECORD
    } else {
        state.recorder.append(&info)
    };

    let mut ctx = RequestContext {
        protocol: target.protocol,
        url: target.url,
        request_options: RequestOptions {
            hostname: target.hostname,
            port: target.port,
            path: target.path,
            method: parts.method,
            headers: parts.headers,
        },
        request_data,
        response: None,
    };
    if let Some(update) = state.hooks.before_send_request(&ctx).await {
        ctx.merge(update);
    }

    let outgoing = match obtain_response(&ctx, &state).await {
        Ok(outgoing) => outgoing,
        Err(err) => recover(&ctx, err, &state).await,
    };

    let (response, recorded) = match send_response(outgoing, state.throttle.as_ref()) {
        Ok(sent) => sent,
        Err(err) => {
            warn!("Cannot send response for {}: {}", ctx.url, err);
            send_response(Outgoing::Buffered(error_detail(&err, &ctx.url)), None)?
        }
    };

    info.finish(response.status().as_u16(), response.headers(), recorded);
    state.recorder.update(record_id, &info);
    Ok(response)
}

async fn obtain_response(ctx: &RequestContext, state: &ProxyState) -> ProxyResult<Outgoing> {
    match fetch_upstream(ctx, state).await? {
        Fetched::Injected(detail) => Ok(Outgoing::Buffered(detail)),
        Fetched::Streamed(streamed) => Ok(Outgoing::Streamed(streamed)),
        Fetched::Buffered(mut detail) => {
            decompress_response(&mut detail)?;
            let detail = state
                .hooks
                .before_send_response(ctx, &detail)
                .await
                .unwrap_or(detail);
            Ok(Outgoing::Buffered(detail))
        }
    }
}

async fn fetch_upstream(ctx: &RequestContext, state: &ProxyState) -> ProxyResult<Fetched> {
    if let Some(response) = &ctx.response {
        debug!("Serving injected response for {}", ctx.url);
        return Ok(Fetched::Injected(response.clone()));
    }

    let options = &ctx.request_options;
    let stream = connect_upstream(
        &options.hostname,
        options.port,
        ctx.protocol.is_secure(),
        &state.connector,
        state.upstream_timeout,
    )
    .await?;

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;

    let addr = format_addr(&options.hostname, options.port);
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection to {} ended: {}", addr, e);
        }
    });

    let request = build_upstream_request(ctx)?;
    let response = tokio::time::timeout(state.upstream_timeout, sender.send_request(request))
        .await
        .map_err(|_| ProxyError::Timeout(format!("waiting for {}", ctx.target_url())))??;

    collect_response(response, state.chunk_threshold).await
}

fn build_upstream_request(ctx: &RequestContext) -> ProxyResult<Request<Full<Bytes>>> {
    let options = &ctx.request_options;

    let mut headers = options.headers.clone();
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.remove("proxy-connection");
    if !ctx.request_data.is_empty() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(ctx.request_data.len()));
    }
    if !headers.contains_key(HOST) {
        let host = if options.port != ctx.protocol.default_port() {
            format_addr(&options.hostname, options.port)
        } else if options.hostname.contains(':') {
            format!("[{}]", options.hostname)
        } else {
            options.hostname.clone()
        };
        let value = HeaderValue::from_str(&host)
            .map_err(|e| ProxyError::InvalidRequest(format!("bad host '{}': {}", host, e)))?;
        headers.insert(HOST, value);
    }

    let path = if options.path.starts_with('/') {
        options.path.as_str()
    } else {
        "/"
    };

    let mut request = Request::builder()
        .method(options.method.clone())
        .uri(path)
        .body(Full::new(ctx.request_data.clone()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Buffer the body up to `threshold` bytes, then hand over to streaming.
async fn collect_response(response: Response<Incoming>, threshold: usize) -> ProxyResult<Fetched> {
    let (parts, mut body) = response.into_parts();
    let mut chunks = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        total += data.len();
        chunks.push(data);
        if total > threshold {
            debug!("Response body passed {} bytes, streaming the rest", threshold);
            return Ok(Fetched::Streamed(StreamedResponse {
                status: parts.status,
                headers: parts.headers,
                body: resume_body(chunks, body),
            }));
        }
    }

    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    Ok(Fetched::Buffered(ResponseDetail::new(
        parts.status,
        parts.headers,
        buf.freeze(),
    )))
}

/// Turn a pipeline failure into a response.
async fn recover(ctx: &RequestContext, err: ProxyError, state: &ProxyState) -> Outgoing {
    if err.is_connection_reset() {
        debug!("Request to {} failed: {}", ctx.url, err);
    } else {
        warn!("Request to {} failed: {}", ctx.url, err);
    }

    if let Some(mut detail) = state.hooks.on_error(ctx, &err).await
        && detail.headers.as_ref().is_some_and(|h| !h.is_empty())
    {
        detail
            .status_code
            .get_or_insert(StatusCode::INTERNAL_SERVER_ERROR);
        return Outgoing::Buffered(detail);
    }

    Outgoing::Buffered(error_detail(&err, &ctx.url))
}

/// The `500` page for a failed exchange.
fn error_detail(err: &ProxyError, url: &str) -> ResponseDetail {
    let mut headers = HeaderMap::new();
    headers.insert("proxy-error", HeaderValue::from_static("true"));
    if let Ok(message) = HeaderValue::from_str(&header_safe(&err.to_string())) {
        headers.insert("proxy-error-message", message);
    }
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    ResponseDetail::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        headers,
        error_page::render(err, url),
    )
}

/// Build the client response and what the recorder should keep of its body.
fn send_response(
    outgoing: Outgoing,
    throttle: Option<&Throttle>,
) -> ProxyResult<(Response<ProxyBody>, RecordedBody)> {
    let (status, mut headers, body, length, recorded) = match outgoing {
        Outgoing::Buffered(detail) => {
            let status = detail
                .status_code
                .ok_or(ProxyError::MissingResponseField("status code"))?;
            let headers = detail
                .headers
                .ok_or(ProxyError::MissingResponseField("headers"))?;
            let recorded = if detail.body.is_empty() {
                RecordedBody::Empty
            } else {
                RecordedBody::Buffered(detail.body.clone())
            };
            let length = detail.body.len();
            (status, headers, full_body(detail.body), Some(length), recorded)
        }
        Outgoing::Streamed(streamed) => (
            streamed.status,
            streamed.headers,
            streamed.body,
            None,
            RecordedBody::BigStream,
        ),
    };

    headers.remove(CONTENT_LENGTH);
    if let Some(connection) = headers.remove(CONNECTION) {
        headers.insert(HeaderName::from_static(ORIGIN_CONNECTION), connection);
    }

    let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
        v.to_str()
            .is_ok_and(|s| s.to_ascii_lowercase().contains("chunked"))
    });
    if let Some(length) = length
        && !chunked
        && throttle.is_none()
    {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    let body = match throttle {
        Some(throttle) => throttle_body(body, throttle.clone()),
        None => body,
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok((response, recorded))
}

fn plain_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn context(headers: HeaderMap) -> RequestContext {
        RequestContext {
            protocol: Protocol::Http,
            url: "http://example.test/".to_string(),
            request_options: RequestOptions {
                hostname: "example.test".to_string(),
                port: 80,
                path: "/submit?x=1".to_string(),
                method: Method::POST,
                headers,
            },
            request_data: Bytes::from_static(b"hello"),
            response: None,
        }
    }

    #[test]
    fn test_target_from_absolute_uri() {
        let req = Request::builder()
            .uri("http://example.test:8080/a?b=c")
            .body(())
            .unwrap();
        let target = request_target(&req, false).unwrap();

        assert_eq!(target.protocol, Protocol::Http);
        assert_eq!(target.hostname, "example.test");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/a?b=c");
        assert_eq!(target.url, "http://example.test:8080/a?b=c");
    }

    #[test]
    fn test_target_from_host_header_on_tls() {
        let req = Request::builder()
            .uri("/inbox")
            .header(HOST, "mail.test")
            .body(())
            .unwrap();
        let target = request_target(&req, true).unwrap();

        assert_eq!(target.protocol, Protocol::Https);
        assert_eq!(target.port, 443);
        assert_eq!(target.url, "https://mail.test/inbox");
    }

    #[test]
    fn test_explicit_http_on_tls_stays_http() {
        let req = Request::builder()
            .uri("http://plain.test/")
            .body(())
            .unwrap();
        let target = request_target(&req, true).unwrap();
        assert_eq!(target.protocol, Protocol::Http);
        assert_eq!(target.port, 80);
    }

    #[test]
    fn test_target_without_host_is_rejected() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(
            request_target(&req, false),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_upstream_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let request = build_upstream_request(&context(headers)).unwrap();

        assert_eq!(request.uri(), "/submit?x=1");
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.headers().get(CONTENT_LENGTH).unwrap(), "5");
        assert!(request.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(request.headers().get(HOST).unwrap(), "example.test");
    }

    #[test]
    fn test_upstream_host_keeps_custom_port() {
        let mut ctx = context(HeaderMap::new());
        ctx.request_options.port = 8080;
        ctx.request_data = Bytes::new();
        let request = build_upstream_request(&ctx).unwrap();

        assert_eq!(request.headers().get(HOST).unwrap(), "example.test:8080");
        assert!(request.headers().get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_send_response_rewrites_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        let detail = ResponseDetail::new(StatusCode::OK, headers, "hello world");

        let (response, recorded) = send_response(Outgoing::Buffered(detail), None).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "11");
        assert!(response.headers().get(CONNECTION).is_none());
        assert_eq!(response.headers().get(ORIGIN_CONNECTION).unwrap(), "close");
        assert!(matches!(recorded, RecordedBody::Buffered(_)));
    }

    #[test]
    fn test_send_response_skips_length_when_chunked_or_throttled() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let detail = ResponseDetail::new(StatusCode::OK, headers, "abc");
        let (response, _) = send_response(Outgoing::Buffered(detail), None).unwrap();
        assert!(response.headers().get(CONTENT_LENGTH).is_none());

        let detail = ResponseDetail::new(StatusCode::OK, HeaderMap::new(), "abc");
        let throttle = Throttle::new(1024);
        let (response, _) = send_response(Outgoing::Buffered(detail), Some(&throttle)).unwrap();
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_send_response_requires_status_and_headers() {
        let detail = ResponseDetail {
            status_code: None,
            headers: Some(HeaderMap::new()),
            body: Bytes::new(),
        };
        let result = send_response(Outgoing::Buffered(detail), None);
        assert!(matches!(
            result,
            Err(ProxyError::MissingResponseField("status code"))
        ));

        let detail = ResponseDetail {
            status_code: Some(StatusCode::OK),
            headers: None,
            body: Bytes::new(),
        };
        let result = send_response(Outgoing::Buffered(detail), None);
        assert!(matches!(
            result,
            Err(ProxyError::MissingResponseField("headers"))
        ));
    }

    #[test]
    fn test_error_detail() {
        let err = ProxyError::UpstreamConnect {
            addr: "example.test:80".to_string(),
            message: "connection refused".to_string(),
        };
        let detail = error_detail(&err, "http://example.test/");
        let headers = detail.headers.as_ref().unwrap();

        assert_eq!(detail.status_code, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(headers.get("proxy-error").unwrap(), "true");
        assert!(
            headers
                .get("proxy-error-message")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("connection refused")
        );
        assert!(String::from_utf8_lossy(&detail.body).contains("Proxy Error"));
    }
}
