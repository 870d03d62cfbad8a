//! Errors raised while packing or unpacking a payload.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The codec could not be set up.
    #[display("codec could not be initialised")]
    Codec,
    /// The payload does not decode, or decodes to the wrong length. The
    /// bytes are bad; fetching them again is the only remedy.
    #[display("payload is corrupt or truncated")]
    Corrupt,
    #[display("unknown compression: {_0}")]
    Unknown(#[error(not(source))] String),
    /// Recognised, but this build was compiled without it.
    #[display("compression {_0} is not enabled in this build")]
    NotEnabled(#[error(not(source))] String),
    #[display("could not write compressed output")]
    Write,
}

impl ErrorKind {
    /// A corrupt payload will stay corrupt; only writes are worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Corrupt, "payload is corrupt or truncated")]
    #[case(ErrorKind::Unknown("rar".to_string()), "unknown compression: rar")]
    #[case(ErrorKind::NotEnabled("zstd".to_string()), "compression zstd is not enabled in this build")]
    fn test_messages(#[case] kind: ErrorKind, #[case] expected: &str) {
        assert_eq!(kind.to_string(), expected);
    }

    #[test]
    fn test_only_writes_are_retryable() {
        assert!(ErrorKind::Write.is_retryable());
        assert!(!ErrorKind::Corrupt.is_retryable());
        assert!(!ErrorKind::Codec.is_retryable());
    }
}
