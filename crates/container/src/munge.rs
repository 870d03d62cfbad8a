use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Constant XOR key applied to every byte of a munged stream.
pub const MUNGE_KEY: u8 = 42;

/// Munge (or un-munge, it's its own inverse) a buffer in place.
pub fn munge_in_place(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        *byte ^= MUNGE_KEY;
    }
}

/// Munged copy of `bytes`.
pub fn munged(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|byte| byte ^ MUNGE_KEY).collect()
}

pin_project! {
    /// Un-munges everything read through it.
    pub struct MungeReader<R> {
        #[pin]
        inner: R,
    }
}

impl<R> MungeReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for MungeReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        munge_in_place(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_munge_is_involution() {
        let original: Vec<u8> = (0..=255).collect();
        let mut bytes = original.clone();
        munge_in_place(&mut bytes);
        assert_ne!(bytes, original);
        assert_eq!(bytes[0], MUNGE_KEY);
        munge_in_place(&mut bytes);
        assert_eq!(bytes, original);
    }

    #[test]
    fn test_header_markers_are_hidden() {
        assert_eq!(munged(b"#:"), vec![b'#' ^ 42, b':' ^ 42]);
        assert!(!munged(b"#ABC:12#").contains(&b'#'));
    }

    #[tokio::test]
    async fn test_reader_unmunges_across_small_reads() {
        let plain = b"block container payload".to_vec();
        let wire = munged(&plain);
        let mut reader = MungeReader::new(wire.as_slice());
        let mut first = [0u8; 5];
        reader.read_exact(&mut first).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!([first.as_slice(), rest.as_slice()].concat(), plain);
    }
}
