//! Token-bucket bandwidth throttle.
//!
//! A single [`Throttle`] is created from configuration and shared by every
//! connection, so the configured rate is a global cap on throttled legs.
//! Only one leg of an exchange is throttled: origin to client.

use super::body::ProxyBody;
use futures_util::StreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared rate limiter, in bytes per second.
#[derive(Debug, Clone)]
pub struct Throttle {
    rate: u64,
    bucket: Arc<Mutex<Bucket>>,
}

impl Throttle {
    /// Create a throttle allowing `bytes_per_sec`, with a one second burst.
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1);
        Self {
            rate,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: rate as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Create a throttle from a kilobytes-per-second setting; 0 disables it.
    pub fn from_kbps(kbps: u64) -> Option<Self> {
        (kbps > 0).then(|| Self::new(kbps.saturating_mul(1024)))
    }

    /// Configured rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Wait until `n` bytes may pass.
    pub async fn consume(&self, n: usize) {
        let mut remaining = n as u64;
        while remaining > 0 {
            let want = remaining.min(self.rate);
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.rate as f64);
                bucket.last_refill = now;

                if bucket.tokens >= want as f64 {
                    bucket.tokens -= want as f64;
                    remaining -= want;
                    None
                } else {
                    let deficit = want as f64 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate as f64))
                }
            };
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Copy `reader` into `writer` at the throttle's rate, then shut the writer down.
pub async fn copy_throttled<R, W>(reader: &mut R, writer: &mut W, throttle: &Throttle) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        throttle.consume(n).await;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Pace every data frame of `body` through the throttle.
pub fn throttle_body(body: ProxyBody, throttle: Throttle) -> ProxyBody {
    let frames = BodyStream::new(body).then(move |frame| {
        let throttle = throttle.clone();
        async move {
            if let Ok(frame) = &frame
                && let Some(data) = frame.data_ref()
            {
                throttle.consume(data.len()).await;
            }
            frame
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::body::full_body;

    #[test]
    fn test_from_kbps() {
        assert!(Throttle::from_kbps(0).is_none());
        assert_eq!(Throttle::from_kbps(1).unwrap().rate(), 1024);
        assert_eq!(Throttle::from_kbps(100).unwrap().rate(), 102_400);
    }

    #[tokio::test]
    async fn test_burst_passes_immediately() {
        let throttle = Throttle::new(10_000);
        let start = Instant::now();
        throttle.consume(5_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_consume_waits_for_refill() {
        let throttle = Throttle::new(1_000);
        throttle.consume(1_000).await;

        let start = Instant::now();
        throttle.consume(200).await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_copy_throttled_copies_everything() {
        let throttle = Throttle::new(1024 * 1024);
        let data = vec![7u8; 40_000];
        let mut reader = &data[..];
        let mut out = Vec::new();

        let copied = copy_throttled(&mut reader, &mut out, &throttle).await.unwrap();
        assert_eq!(copied, 40_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_throttle_body_preserves_bytes() {
        let throttle = Throttle::new(1024 * 1024);
        let body = throttle_body(full_body("hello world"), throttle);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
    }
}
