use crate::entry::{LogicalPath, Root};
use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// The absolute directories backing each logical [`Root`].
#[derive(Clone, Debug)]
pub struct Roots {
    cache: PathBuf,
    external: Option<PathBuf>,
}

impl Roots {
    /// Both directories must be absolute.
    pub fn new(cache: impl Into<PathBuf>, external: Option<PathBuf>) -> Result<Self> {
        let cache = cache.into();
        for dir in std::iter::once(&cache).chain(external.as_ref()) {
            if !dir.is_absolute() {
                exn::bail!(ErrorKind::InvalidPath(dir.clone()));
            }
        }
        Ok(Self { cache, external })
    }

    pub fn cache(&self) -> &Path {
        &self.cache
    }

    pub fn external(&self) -> Option<&Path> {
        self.external.as_deref()
    }

    pub fn directory(&self, root: Root) -> Option<&Path> {
        match root {
            Root::Cache => Some(&self.cache),
            Root::External => self.external.as_deref(),
        }
    }

    /// Map an absolute path onto a logical root.
    ///
    /// Matching is case-insensitive. When one root contains the other, the
    /// deeper one wins. Returns `None` for paths outside every root (or paths
    /// that would point at a root directory itself).
    pub fn logical(&self, absolute: &Path) -> Option<LogicalPath> {
        [(Root::Cache, Some(&self.cache)), (Root::External, self.external.as_ref())]
            .into_iter()
            .filter_map(|(root, dir)| Some((root, dir?)))
            .filter_map(|(root, dir)| strip_root(dir, absolute).map(|suffix| (root, dir.components().count(), suffix)))
            .max_by_key(|(_, depth, _)| *depth)
            .and_then(|(root, _, suffix)| LogicalPath::new(root, &suffix).ok())
    }

    /// Absolute location of a logical path, if its root is configured.
    pub fn resolve(&self, logical: &LogicalPath) -> Option<PathBuf> {
        let dir = self.directory(logical.root())?;
        Some(logical.suffix().split('/').fold(dir.to_path_buf(), |path, part| path.join(part)))
    }
}

/// Remaining components of `path` below `root`, joined with `/`.
fn strip_root(root: &Path, path: &Path) -> Option<String> {
    let mut path_components = path.components();
    for expected in root.components() {
        let actual = path_components.next()?;
        let matches = match (expected, actual) {
            (Component::Normal(a), Component::Normal(b)) => {
                a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
            },
            (a, b) => a == b,
        };
        if !matches {
            return None;
        }
    }
    let rest: Vec<String> = path_components.map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    (!rest.is_empty()).then(|| rest.join("/"))
}
