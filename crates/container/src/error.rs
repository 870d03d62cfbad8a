use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The stream ended inside a header or a payload. Framing is lost; no
    /// further entries can be read from this container.
    #[display("container truncated while reading {_0}")]
    Truncated(#[error(not(source))] &'static str),
    /// A header did not follow `#<hash>:<length>#`. Framing is lost.
    #[display("malformed block header: {_0}")]
    MalformedHeader(#[error(not(source))] String),
    /// The block payload did not decompress to its declared content.
    #[display("block payload failed to decompress")]
    Decompression,
    /// The underlying reader or writer failed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io)
    }

    /// Returns `true` if the error means the byte stream itself is corrupt.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Truncated(_) | Self::MalformedHeader(_) | Self::Decompression)
    }
}
