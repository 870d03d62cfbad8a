//! Failures from the transfer and cache crates are re-raised into one of
//! these kinds so callers can match on what to do next.

use attire_cache::ContentHash;
use derive_more::{Display, Error};
use exn::ResultExt;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies why a download or upload failed.
///
/// ### Per file or group
/// - [`ErrorKind::Transfer`]
/// - [`ErrorKind::Rejected`]
/// - [`ErrorKind::Corruption`]
/// - [`ErrorKind::QueueTimeout`]
/// - [`ErrorKind::Storage`]
///
/// ### Whole request
/// - [`ErrorKind::Broker`]
/// - [`ErrorKind::Cancelled`]
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller cancelled. Never retried.
    #[display("cancelled")]
    Cancelled,
    /// The broker couldn't be asked about the requested set at all (sizes or
    /// enqueue failed), so nothing in it was attempted.
    #[display("file broker unavailable")]
    Broker,
    /// A queued batch never became ready.
    #[display("queued request {_0} timed out")]
    QueueTimeout(#[error(not(source))] String),
    /// Moving bytes failed.
    #[display("transfer failed")]
    Transfer,
    /// The broker refused the transfer (401/404).
    #[display("transfer rejected by broker")]
    Rejected,
    /// Received content doesn't match its hash or its framing.
    #[display("corrupt content for {_0}")]
    Corruption(#[error(not(source))] ContentHash),
    /// Reading or writing the local cache failed.
    #[display("local storage failure")]
    Storage,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer | Self::QueueTimeout(_) | Self::Broker)
    }

    /// Map a transfer failure onto what it means for one file.
    pub(crate) fn from_transfer(kind: &attire_transfer::error::ErrorKind) -> Self {
        use attire_transfer::error::ErrorKind as Transfer;
        match kind {
            Transfer::Cancelled => Self::Cancelled,
            Transfer::InvalidData(_) => Self::Rejected,
            Transfer::NotConnected | Transfer::Network | Transfer::InvalidResponse | Transfer::InvalidUrl(_) => {
                Self::Transfer
            },
        }
    }
}

/// Re-raise a transfer failure under the kind it means for one file.
pub(crate) fn raise_transfer<T>(result: attire_transfer::error::Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            let kind = ErrorKind::from_transfer(&err);
            Err(err).or_raise(|| kind)
        },
    }
}
