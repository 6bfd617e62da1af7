//! Outbound connections to origin servers.

use super::error::{ProxyError, ProxyResult};
use super::tls::{classify_tls_error, domain_to_server_name};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Raw upstream stream, either plain TCP or TLS.
pub enum UpstreamStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Open a TCP connection, bounded by `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> ProxyResult<TcpStream> {
    let addr = format_addr(host, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProxyError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

    debug!("Connected to upstream {}", addr);
    Ok(stream)
}

/// Connect to an origin, performing the TLS handshake when `secure`.
pub async fn connect_upstream(
    host: &str,
    port: u16,
    secure: bool,
    connector: &TlsConnector,
    timeout: Duration,
) -> ProxyResult<UpstreamStream> {
    let stream = dial(host, port, timeout).await?;
    if !secure {
        return Ok(UpstreamStream::Plain(stream));
    }

    let server_name = domain_to_server_name(host)?;
    let tls = tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| ProxyError::Timeout(format!("TLS handshake with {}", host)))?
        .map_err(|e| classify_tls_error(host, e))?;

    debug!("TLS established with upstream {}:{}", host, port);
    Ok(UpstreamStream::Tls(Box::new(tls)))
}

/// Render `host:port`, bracketing IPv6 literals.
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split an authority into host and port, stripping IPv6 brackets and userinfo.
///
/// Returns `None` for an empty host or an unparseable port.
pub fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse::<u16>().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        (host, port)
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        (host, port.parse::<u16>().ok()?)
    } else {
        (authority, default_port)
    };

    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
