use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep, sleep_until};

const WINDOW: Duration = Duration::from_secs(1);

/// A bytes-per-second limit shared between whoever sets it and every reader
/// that obeys it. Zero means unlimited.
///
/// Cloning is cheap and clones observe each other's updates. Readers pick up a
/// new value on their next chunk, so there's a short window where a stream is
/// still running at the old rate.
#[derive(Clone, Debug, Default)]
pub struct Throttle(Arc<AtomicU64>);

impl Throttle {
    pub fn new(bytes_per_second: u64) -> Self {
        Self(Arc::new(AtomicU64::new(bytes_per_second)))
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn set(&self, bytes_per_second: u64) {
        self.0.store(bytes_per_second, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn is_unlimited(&self) -> bool {
        self.get() == 0
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`], never handing out more than the current
    /// [`Throttle`] limit worth of bytes per one-second window.
    ///
    /// When the window's budget is used up the reader parks on a timer until
    /// the next window opens, rather than spinning.
    pub struct ThrottledReader<R> {
        #[pin]
        inner: R,
        throttle: Throttle,
        window_start: Instant,
        window_bytes: u64,
        delay: Option<Pin<Box<Sleep>>>,
    }
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, throttle: Throttle) -> Self {
        Self {
            inner,
            throttle,
            window_start: Instant::now(),
            window_bytes: 0,
            delay: None,
        }
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for ThrottledReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if let Some(delay) = this.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                *this.delay = None;
            }

            let limit = this.throttle.get();
            if limit == 0 || buf.remaining() == 0 {
                return this.inner.poll_read(cx, buf);
            }

            let now = Instant::now();
            if now.duration_since(*this.window_start) >= WINDOW {
                *this.window_start = now;
                *this.window_bytes = 0;
            }
            if *this.window_bytes >= limit {
                *this.delay = Some(Box::pin(sleep_until(*this.window_start + WINDOW)));
                continue;
            }

            let budget = usize::try_from(limit - *this.window_bytes).unwrap_or(usize::MAX);
            let max = budget.min(buf.remaining());
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max));
            ready!(this.inner.as_mut().poll_read(cx, &mut limited))?;
            let read = limited.filled().len();
            buf.advance(read);
            *this.window_bytes += read as u64;
            return Poll::Ready(Ok(()));
        }
    }
}
