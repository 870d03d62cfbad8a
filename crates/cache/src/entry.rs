use crate::error::{ErrorKind, Result};
use crate::hash::ContentHash;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;

/// Which configured directory a [`LogicalPath`] is relative to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Root {
    /// The content store, owned by the cache.
    Cache,
    /// A user-managed directory the cache only observes.
    External,
}

impl Root {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Cache => "{cache}",
            Self::External => "{external}",
        }
    }
}

/// A path relative to one of the logical roots, e.g. `{cache}/A9993E36...`.
///
/// The suffix keeps its original case for resolution on case-sensitive
/// filesystems, but paths compare (and are indexed) case-insensitively.
#[derive(Clone, Debug)]
pub struct LogicalPath {
    root: Root,
    suffix: String,
}

impl LogicalPath {
    /// Suffix separators are normalized to `/`; `..` may not climb out of the
    /// root.
    pub fn new(root: Root, suffix: &str) -> Result<Self> {
        Ok(Self { root, suffix: normalize_suffix(suffix)? })
    }

    pub fn root(&self) -> Root {
        self.root
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Case-folded form used as the index key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.root.prefix(), self.suffix.to_lowercase())
    }
}

impl PartialEq for LogicalPath {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for LogicalPath {}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", self.root.prefix(), self.suffix)
    }
}

impl FromStr for LogicalPath {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        for root in [Root::Cache, Root::External] {
            if let Some(rest) = s.strip_prefix(root.prefix())
                && let Some(suffix) = rest.strip_prefix(['/', '\\'])
            {
                return Self::new(root, suffix);
            }
        }
        exn::bail!(ErrorKind::InvalidPath(PathBuf::from(s)))
    }
}

/// Resolve a root-relative path into `/`-separated normal components.
///
/// Both separators are accepted since paths may have been recorded on another
/// platform. Null bytes are rejected, as is anything that normalizes to
/// nothing or leaves the root.
pub(crate) fn normalize_suffix(suffix: &str) -> Result<String> {
    let invalid = || ErrorKind::InvalidPath(PathBuf::from(suffix));
    let mut components: Vec<&str> = Vec::new();
    for component in suffix.split(['/', '\\']) {
        match component {
            "" | "." => {},
            ".." => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
            normal if normal.contains('\0') => exn::bail!(invalid()),
            normal => components.push(normal),
        }
    }
    if components.is_empty() {
        exn::bail!(invalid());
    }
    Ok(components.join("/"))
}

/// One indexed file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: ContentHash,
    pub logical_path: LogicalPath,
    /// Absolute location under the currently configured roots. Derived, never
    /// persisted.
    pub resolved_path: PathBuf,
    /// Decompressed size in bytes.
    pub size: u64,
    pub compressed_size: Option<u64>,
    /// Modification time (nanoseconds since the Unix epoch) observed when the
    /// file was last hashed. A cheap staleness check, not a content hash.
    pub modified_ticks: i64,
}

/// What [`ContentCache::revalidate`](crate::ContentCache::revalidate) found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Unchanged since it was indexed.
    Valid,
    /// Modified since it was indexed; rehashed and re-indexed under this hash.
    Updated(ContentHash),
    /// Gone (or unreadable); removed from the index.
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a/b/c", "a/b/c")]
    #[case("a\\b\\c", "a/b/c")]
    #[case("a//b/./c/", "a/b/c")]
    #[case("/leading", "leading")]
    #[case("a/../b", "b")]
    #[case("Mixed/CASE.mdl", "Mixed/CASE.mdl")]
    fn test_normalize_suffix(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_suffix(input).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::only_dots("./.")]
    #[case::escape("../etc/passwd")]
    #[case::escape_middle("a/../../b")]
    #[case::null("a\0b")]
    fn test_normalize_suffix_invalid(#[case] input: &str) {
        let err = normalize_suffix(input).unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_logical_path_compares_case_insensitively() {
        let a = LogicalPath::new(Root::External, "Mods/Shirt.TEX").unwrap();
        let b = LogicalPath::new(Root::External, "mods\\shirt.tex").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), "{external}/mods/shirt.tex");
        assert_eq!(a.to_string(), "{external}/Mods/Shirt.TEX");
        assert_ne!(a, LogicalPath::new(Root::Cache, "Mods/Shirt.TEX").unwrap());
    }

    #[rstest]
    #[case("{cache}/ABC", Root::Cache, "ABC")]
    #[case("{external}\\Mods\\File.mdl", Root::External, "Mods/File.mdl")]
    fn test_logical_path_parse(#[case] input: &str, #[case] root: Root, #[case] suffix: &str) {
        let path: LogicalPath = input.parse().unwrap();
        assert_eq!(path.root(), root);
        assert_eq!(path.suffix(), suffix);
    }

    #[rstest]
    #[case("ABC")]
    #[case("{cache}")]
    #[case("{cache}/")]
    #[case("{penumbra}/ABC")]
    #[case("{cache}ABC")]
    fn test_logical_path_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<LogicalPath>().is_err());
    }
}
