use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Transferred/total byte counters for one transfer.
///
/// The transferred count only ever grows. Any number of clones may add to it
/// or read it from different tasks.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    transferred: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            transferred: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(total)),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`] and adds every byte read to a [`Progress`].
    pub struct ProgressReader<R> {
        #[pin]
        inner: R,
        progress: Progress,
    }
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: Progress) -> Self {
        Self { inner, progress }
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}

impl<R: AsyncRead> AsyncRead for ProgressReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.progress.add((buf.filled().len() - before) as u64);
        Poll::Ready(Ok(()))
    }
}
