//! The on-disk copy of the index.
//!
//! One entry per line: `hash|logical_path|mtime_ticks|size|compressed_size`,
//! with the compressed size left empty when unknown. The index is only ever
//! replaced by renaming a fully-written sibling over it; the previous copy is
//! kept as `.bak` until that rename succeeds.

use crate::entry::{CacheEntry, LogicalPath};
use crate::error::{ErrorKind, Result};
use crate::roots::Roots;
use exn::ResultExt;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

const DELIMITER: char = '|';

pub(crate) fn format_line(entry: &CacheEntry) -> String {
    format!(
        "{hash}{d}{path}{d}{ticks}{d}{size}{d}{compressed}",
        d = DELIMITER,
        hash = entry.hash,
        path = entry.logical_path,
        ticks = entry.modified_ticks,
        size = entry.size,
        compressed = entry.compressed_size.map(|c| c.to_string()).unwrap_or_default(),
    )
}

/// Why a persisted line was dropped on load.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Rejected {
    Malformed,
    /// Recorded against a root that isn't configured any more.
    Unrooted(LogicalPath),
}

pub(crate) fn parse_line(line: &str, roots: &Roots) -> std::result::Result<CacheEntry, Rejected> {
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    let [hash, path, ticks, size, compressed] = fields.as_slice() else {
        return Err(Rejected::Malformed);
    };
    let hash = hash.parse().map_err(|_| Rejected::Malformed)?;
    let logical_path: LogicalPath = path.parse().map_err(|_| Rejected::Malformed)?;
    let modified_ticks = ticks.trim().parse().map_err(|_| Rejected::Malformed)?;
    let size = size.trim().parse().map_err(|_| Rejected::Malformed)?;
    let compressed_size = match compressed.trim() {
        "" => None,
        value => Some(value.parse().map_err(|_| Rejected::Malformed)?),
    };
    let Some(resolved_path) = roots.resolve(&logical_path) else {
        return Err(Rejected::Unrooted(logical_path));
    };
    Ok(CacheEntry { hash, logical_path, resolved_path, size, compressed_size, modified_ticks })
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Where a new index is written before it replaces the old one.
pub(crate) fn writing_path(path: &Path) -> PathBuf {
    sibling(path, "writing")
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    sibling(path, "bak")
}

/// Read the persisted index, recovering from an interrupted write first.
///
/// A `.bak` next to a missing index means the last write died between
/// backing up and renaming: promote it. A `.bak` next to an index means the
/// write completed but cleanup didn't: discard it.
pub(crate) async fn read(path: &Path) -> Result<Option<String>> {
    let backup = backup_path(path);
    let primary_exists = tokio::fs::try_exists(path).await.or_raise(|| ErrorKind::Persist)?;
    if tokio::fs::try_exists(&backup).await.or_raise(|| ErrorKind::Persist)? {
        if primary_exists {
            tracing::debug!(path = %backup.display(), "Discarding stale index backup");
            tokio::fs::remove_file(&backup).await.or_raise(|| ErrorKind::Persist)?;
        } else {
            tracing::warn!(path = %backup.display(), "Index missing; restoring from backup");
            tokio::fs::rename(&backup, path).await.or_raise(|| ErrorKind::Persist)?;
        }
    }
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).or_raise(|| ErrorKind::Persist),
    }
}

/// Replace the persisted index with `lines`.
pub(crate) async fn write(path: &Path, lines: &[String]) -> Result<()> {
    let backup = backup_path(path);
    let temporary = writing_path(path);
    let mut contents = lines.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    tokio::fs::write(&temporary, contents).await.or_raise(|| ErrorKind::Persist)?;
    match tokio::fs::copy(path, &backup).await {
        Ok(_) => {},
        Err(e) if e.kind() == IoErrorKind::NotFound => {},
        Err(e) => return Err(e).or_raise(|| ErrorKind::Persist),
    }
    tokio::fs::rename(&temporary, path).await.or_raise(|| ErrorKind::Persist)?;
    if let Err(e) = tokio::fs::remove_file(&backup).await
        && e.kind() != IoErrorKind::NotFound
    {
        tracing::warn!(path = %backup.display(), error = %e, "Could not remove index backup");
    }
    tracing::debug!(path = %path.display(), entries = lines.len(), "Persisted cache index");
    Ok(())
}
