//! Cache errors.

use crate::hash::ContentHash;
use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Grouped by what the caller can do about them.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Not a 40 character hexadecimal SHA-1 digest.
    #[display("invalid content hash: {_0}")]
    InvalidHash(#[error(not(source))] String),
    /// Path escapes its root, contains null bytes, or is otherwise unusable.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Path isn't located under any configured root.
    #[display("path is outside of the cache and external roots: {}", _0.display())]
    OutsideRoots(#[error(not(source))] PathBuf),
    /// Content on disk doesn't hash to what it was supposed to be. The file is
    /// corrupt and should be deleted.
    #[display("content hash mismatch: expected {_0}, found {_1}")]
    HashMismatch(#[error(not(source))] ContentHash, ContentHash),
    /// Reading or writing the persisted index failed.
    #[display("could not persist cache index")]
    Persist,
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persist | Self::Io)
    }

    /// Returns `true` if the error means on-disk content is corrupt.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::HashMismatch(..))
    }
}
