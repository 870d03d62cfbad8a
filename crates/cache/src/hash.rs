use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sha1::{Digest, Sha1};
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

const DIGEST_LEN: usize = 20;
const READ_BUFFER: usize = 64 * 1024;

/// SHA-1 digest of a file's decompressed content.
///
/// Parsing accepts either case; the canonical form (displayed, persisted and
/// sent to the broker) is 40 upper-case hexadecimal characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; DIGEST_LEN]);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha1::digest(bytes).into())
    }

    /// Hash a file on disk without loading it all into memory.
    pub async fn of_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = tokio::fs::File::open(path.as_ref()).await.or_raise(|| ErrorKind::Io)?;
        let mut hasher = Sha1::new();
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            let read = file.read(&mut buffer).await.or_raise(|| ErrorKind::Io)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl FromStr for ContentHash {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes).or_raise(|| ErrorKind::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "ContentHash({self})")
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(|err: crate::error::Error| serde::de::Error::custom(&*err))
    }
}
