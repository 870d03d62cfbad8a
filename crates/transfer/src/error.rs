//! Transfer Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A transfer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller's cancellation token fired. Never retried, never swallowed.
    #[display("transfer cancelled")]
    Cancelled,
    /// No broker endpoint is known; connect first.
    #[display("not connected to a file broker")]
    NotConnected,
    /// The broker refused the request (401 or 404). Retrying the same request
    /// won't help.
    #[display("broker rejected request with status {_0}")]
    InvalidData(#[error(not(source))] u16),
    /// Transport failure, or any other unsuccessful status.
    #[display("network error")]
    Network,
    /// The broker answered with a body that doesn't match the API.
    #[display("unexpected response from broker")]
    InvalidResponse,
    #[display("invalid broker URL: {_0}")]
    InvalidUrl(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }
}
