//! Per-client bandwidth limiting. One [`RateLimiter`] is shared by every
//! connection a client's sessions open (transfer, out-of-band, keepalive),
//! so the cap applies to the client as a whole. [`Throttled`] wraps any
//! transport and delays reads once the bucket runs dry; writes are control
//! traffic and pass through.

use super::Reconnector;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Token bucket refilled continuously at `bytes_per_sec`, holding at most
/// one second of burst.
pub struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        Arc::new(RateLimiter {
            bytes_per_sec,
            state: Mutex::new(BucketState {
                tokens: bytes_per_sec as f64,
                refilled_at: Instant::now(),
            }),
        })
    }

    /// Take `amount` tokens; returns how long the caller must wait before
    /// the debt is covered.
    fn consume(&self, amount: u64) -> Duration {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.refilled_at = now;
        state.tokens =
            (state.tokens + elapsed * self.bytes_per_sec as f64).min(self.bytes_per_sec as f64);
        state.tokens -= amount as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.bytes_per_sec as f64)
        }
    }
}

/// Transport wrapper enforcing a shared read-rate limit.
pub struct Throttled<T> {
    inner: T,
    limiter: Arc<RateLimiter>,
    delay: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<T> Throttled<T> {
    pub fn new(inner: T, limiter: Arc<RateLimiter>) -> Self {
        Throttled { inner, limiter, delay: None }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Throttled<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(delay) = self.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Ready(()) => self.delay = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let got = (buf.filled().len() - before) as u64;
                if got > 0 {
                    let wait = self.limiter.consume(got);
                    if !wait.is_zero() {
                        // Debt paid before the next read is allowed.
                        self.delay = Some(Box::pin(tokio::time::sleep(wait)));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Throttled<T> {
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
}

/// Reconnector adapter: every connection it hands out shares the same
/// limiter.
pub struct ThrottledReconnector<R> {
    inner: R,
    limiter: Arc<RateLimiter>,
}

impl<R> ThrottledReconnector<R> {
    pub fn new(inner: R, limiter: Arc<RateLimiter>) -> Self {
        ThrottledReconnector { inner, limiter }
    }
}

impl<R: Reconnector> Reconnector for ThrottledReconnector<R> {
    type Transport = Throttled<R::Transport>;

    async fn connect(&mut self) -> io::Result<Self::Transport> {
        let transport = self.inner.connect().await?;
        Ok(Throttled::new(transport, Arc::clone(&self.limiter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn bucket_charges_debt() {
        let limiter = RateLimiter::new(1000);
        // The burst allowance covers the first second's worth.
        assert!(limiter.consume(1000).is_zero());
        // The next kilobyte must wait about a second.
        let wait = limiter.consume(1000);
        assert!(wait > Duration::from_millis(800), "waited {wait:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_read_paces_to_the_limit() {
        let (mut tx, rx) = tokio::io::duplex(1 << 20);
        let limiter = RateLimiter::new(1024);
        let mut throttled = Throttled::new(rx, limiter);

        tx.write_all(&[0u8; 4096]).await.unwrap();
        tx.flush().await.unwrap();

        // 4 KiB at 1 KiB/s with a 1 KiB burst: the debt from each read
        // delays the next, two full seconds across four reads.
        let started = tokio::time::Instant::now();
        let mut buf = vec![0u8; 1024];
        for _ in 0..4 {
            throttled.read_exact(&mut buf).await.unwrap();
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "took {elapsed:?}");
    }
}
