use std::fmt::{Display, Formatter, Result as FmtResult};

pub(crate) const MARKER: u8 = b'#';
pub(crate) const SEPARATOR: u8 = b':';
/// Longest hash accepted in a header. Digests in use are 40 characters; this
/// only bounds how far a corrupt stream is read before giving up.
pub(crate) const MAX_HASH_LEN: usize = 128;
/// `u64::MAX` has 20 decimal digits.
pub(crate) const MAX_LENGTH_DIGITS: usize = 20;

/// The `#<hash>:<length>#` prefix of a container entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: String,
    /// Length of the (compressed) payload that follows the header.
    pub length: u64,
}

impl BlockHeader {
    pub fn new(hash: impl Into<String>, length: u64) -> Self {
        Self { hash: hash.into(), length }
    }

    /// Plain (un-munged) header bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "#{}:{}#", self.hash, self.length)
    }
}
