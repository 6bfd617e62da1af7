//! First-chunk sniffing for upgraded CONNECT streams.
//!
//! An upgraded hyper connection cannot `peek`, so the first chunk is read
//! normally and handed back through [`Rewind`], which replays it ahead of
//! the live stream.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const SNIFF_BUFFER_SIZE: usize = 8 * 1024;

/// A stream with a prefix that is read before the inner stream.
#[derive(Debug)]
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    /// Wrap `inner`, replaying `prefix` first.
    pub fn new(inner: T, prefix: Bytes) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }

    /// Bytes not yet replayed.
    pub fn pending_prefix(&self) -> &[u8] {
        self.prefix.as_deref().unwrap_or_default()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Read the first chunk of `io` and return a stream that still yields it.
///
/// An empty chunk means the client closed before sending anything.
pub async fn sniff<T: AsyncRead + Unpin>(mut io: T) -> io::Result<(Rewind<T>, Bytes)> {
    let mut buf = vec![0u8; SNIFF_BUFFER_SIZE];
    let n = io.read(&mut buf).await?;
    buf.truncate(n);
    let first = Bytes::from(buf);
    Ok((Rewind::new(io, first.clone()), first))
}

/// Whether a first chunk is a plaintext GET (bare HTTP or a WebSocket upgrade).
pub fn is_plain_get(first_chunk: &[u8]) -> bool {
    first_chunk.starts_with(b"GET ")
}

/// Request target of a plaintext request line, e.g. `/chat` from `GET /chat HTTP/1.1`.
pub fn request_path(first_chunk: &[u8]) -> Option<&str> {
    let line_end = first_chunk
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(first_chunk.len());
    let line = std::str::from_utf8(&first_chunk[..line_end]).ok()?;
    line.split(' ').nth(1)
}
