//! Per-file payload compression.
//!
//! Files cross the wire one at a time, each packed on its own, so a batched
//! container can be split into blocks and every block unpacked without
//! looking at its neighbours. LZ4 blocks are what the broker serves; Gzip is
//! always compiled in and Zstd sits behind the `zstd` feature. With the
//! `serde` feature a [`Compression`] reads and writes as its name.

mod codec;
pub mod error;

use crate::error::{Error, ErrorKind};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    /// LZ4 block, led by the unpacked length as a little-endian `u32`.
    #[default]
    Lz4,
    Gzip,
    #[cfg(feature = "zstd")]
    Zstd,
}

impl Compression {
    /// The name used in configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Gzip => "gzip",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let codec = match name.to_ascii_lowercase().as_str() {
            "none" => Compression::None,
            "lz4" => Compression::Lz4,
            "gz" | "gzip" => Compression::Gzip,
            #[cfg(feature = "zstd")]
            "zst" | "zstd" => Compression::Zstd,
            #[cfg(not(feature = "zstd"))]
            "zst" | "zstd" => exn::bail!(ErrorKind::NotEnabled(name.to_string())),
            _ => exn::bail!(ErrorKind::Unknown(name.to_string())),
        };
        Ok(codec)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Compression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Compression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = <String as serde::Deserialize>::deserialize(deserializer)?;
        name.parse().map_err(|err: Error| serde::de::Error::custom(&*err))
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[test]
    fn test_broker_format_is_default() {
        assert_eq!(Compression::default(), Compression::Lz4);
    }

    #[rstest]
    #[case("none", Compression::None)]
    #[case("LZ4", Compression::Lz4)]
    #[case("gz", Compression::Gzip)]
    #[case("gzip", Compression::Gzip)]
    #[cfg_attr(feature = "zstd", case("zst", Compression::Zstd))]
    fn test_names(#[case] name: &str, #[case] expected: Compression) {
        let parsed: Compression = name.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string().parse::<Compression>().unwrap(), expected);
    }

    #[rstest]
    #[case("rar")]
    #[case("lz4hc")]
    #[case("")]
    fn test_unknown_names(#[case] name: &str) {
        assert!(name.parse::<Compression>().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_uses_names() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Transfer {
            compression: Compression,
        }
        let parsed: Transfer = serde_json::from_str(r#"{"compression":"gz"}"#).unwrap();
        assert_eq!(parsed.compression, Compression::Gzip);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), r#"{"compression":"gzip"}"#);
        assert!(serde_json::from_str::<Transfer>(r#"{"compression":"rar"}"#).is_err());
    }
}
