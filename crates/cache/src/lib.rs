//! Content-addressed file cache.
//!
//! Tracks every known copy of a file by the SHA-1 of its (decompressed)
//! content. Files live under one of two logical roots:
//! - **`{cache}`**: the content store this crate owns, where downloads land as
//!   `<cache>/<HASH>`.
//! - **`{external}`**: a user-managed directory that is only observed.
//!
//! The filesystem is the source of truth. Entries are revalidated lazily on
//! lookup by comparing the recorded modification time against the live file,
//! and rehashed when it changed. The index itself is persisted to a flat text
//! file (see `persist`) so startup doesn't need to rehash everything; writes
//! are debounced and always go through a single writer.

mod entry;
pub mod error;
mod evict;
mod hash;
mod index;
mod persist;
mod roots;

pub use crate::entry::{CacheEntry, LogicalPath, Root, ValidationOutcome};
pub use crate::evict::EvictionReport;
pub use crate::hash::ContentHash;
pub use crate::roots::Roots;
use crate::error::{ErrorKind, Result};
use crate::index::Index;
use crate::persist::Rejected;
use exn::{OptionExt, ResultExt};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::instrument;

/// Default file name of the persisted index, inside the cache root.
pub const INDEX_FILE_NAME: &str = "attire-index.txt";
const TEMPORARY_EXTENSION: &str = "tmp";

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Where to persist the index. Defaults to [`INDEX_FILE_NAME`] in the
    /// cache root.
    pub index_file: Option<PathBuf>,
    /// Changes are written at most this long after they happen.
    pub persist_debounce: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { index_file: None, persist_debounce: Duration::from_secs(2) }
    }
}

/// Handle to the cache. Cheap to clone; every clone shares one index.
///
/// Pending debounced writes are lost if the last handle is dropped before
/// they happen. Call [`flush`](Self::flush) on shutdown.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<Inner>,
}

struct Inner {
    roots: Roots,
    index: RwLock<Index>,
    index_file: PathBuf,
    /// Keys of the index file and its siblings, which are never content.
    reserved: Vec<String>,
    writer: Mutex<()>,
    dirty: Arc<Notify>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Wake the writer task so it notices it's the last one standing.
        self.dirty.notify_one();
    }
}

impl Inner {
    async fn write_index(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut lines: Vec<String> = self.index.read().await.entries().map(persist::format_line).collect();
        lines.sort();
        persist::write(&self.index_file, &lines).await
    }
}

impl ContentCache {
    /// Open (or create) the cache: load the persisted index, recover from any
    /// interrupted write, and delete partial downloads left behind.
    #[instrument(skip_all, fields(cache = %roots.cache().display()))]
    pub async fn open(roots: Roots, options: CacheOptions) -> Result<Self> {
        tokio::fs::create_dir_all(roots.cache()).await.or_raise(|| ErrorKind::Io)?;
        match remove_stale_temporaries(roots.cache()).await {
            Ok(0) => {},
            Ok(removed) => tracing::info!(removed, "Removed partial downloads"),
            Err(err) => tracing::warn!(error = ?err, "Could not clean up partial downloads"),
        }

        let index_file = options.index_file.unwrap_or_else(|| roots.cache().join(INDEX_FILE_NAME));
        let siblings = [persist::backup_path(&index_file), persist::writing_path(&index_file)];
        let reserved: Vec<String> = std::iter::once(&index_file)
            .chain(&siblings)
            .filter_map(|path| roots.logical(path))
            .map(|logical| logical.key())
            .collect();
        let (index, dropped) = load(&index_file, &roots, &reserved).await?;
        let cache = Self {
            inner: Arc::new(Inner {
                roots,
                index: RwLock::new(index),
                index_file,
                reserved,
                writer: Mutex::new(()),
                dirty: Arc::new(Notify::new()),
            }),
        };
        if dropped > 0 {
            // Don't carry garbage around until the next unrelated change.
            cache.flush().await?;
        }
        cache.spawn_writer(options.persist_debounce);
        Ok(cache)
    }

    fn spawn_writer(&self, debounce: Duration) {
        let dirty = Arc::clone(&self.inner.dirty);
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                dirty.notified().await;
                tokio::time::sleep(debounce).await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if let Err(err) = inner.write_index().await {
                    tracing::error!(error = ?err, "Failed to persist cache index");
                }
            }
        });
    }

    fn mark_dirty(&self) {
        self.inner.dirty.notify_one();
    }

    pub fn roots(&self) -> &Roots {
        &self.inner.roots
    }

    /// The logical path of a file that may hold content. The persisted index
    /// and partial downloads live in the cache root too, but aren't content.
    fn logical(&self, path: &Path) -> Option<LogicalPath> {
        let logical = self.inner.roots.logical(path)?;
        if is_bookkeeping(&logical, &self.inner.reserved) {
            tracing::debug!(path = %logical, "Not indexing cache bookkeeping file");
            return None;
        }
        Some(logical)
    }

    /// Where content with this hash lives inside the cache root.
    pub fn content_path(&self, hash: &ContentHash) -> PathBuf {
        self.inner.roots.cache().join(hash.to_string())
    }

    /// Where content with this hash is written while it's still arriving.
    pub fn temp_path(&self, hash: &ContentHash) -> PathBuf {
        self.inner.roots.cache().join(format!("{hash}.{TEMPORARY_EXTENSION}"))
    }

    /// Look up the file at `path`, indexing it on first sight.
    ///
    /// Returns `None` when the path is outside both roots, doesn't exist, or
    /// can't be read.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn resolve(&self, path: impl AsRef<Path>) -> Option<CacheEntry> {
        let Some(logical) = self.logical(path.as_ref()) else {
            tracing::debug!("Path is outside of every root, or isn't content");
            return None;
        };
        let key = logical.key();
        let existing = self.inner.index.read().await.get(&key).cloned();
        if let Some(entry) = existing {
            return match self.revalidate(&entry).await {
                ValidationOutcome::Valid => Some(entry),
                ValidationOutcome::Updated(_) => self.inner.index.read().await.get(&key).cloned(),
                ValidationOutcome::Deleted => None,
            };
        }

        let resolved = self.inner.roots.resolve(&logical)?;
        match inspect(logical, resolved).await {
            Ok(Some(entry)) => {
                tracing::debug!(hash = %entry.hash, "Indexed new file");
                self.put(entry.clone()).await;
                Some(entry)
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = ?err, "Could not index file");
                None
            },
        }
    }

    /// Every known location of `hash`, each revalidated first.
    ///
    /// Locations whose file vanished are dropped from the index; locations
    /// whose content changed are re-indexed under their new hash. Neither is
    /// returned.
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn by_hash(&self, hash: &ContentHash, cache_only: bool) -> Vec<CacheEntry> {
        let candidates: Vec<CacheEntry> = {
            let index = self.inner.index.read().await;
            index
                .keys_for(hash)
                .iter()
                .filter_map(|key| index.get(key).cloned())
                .filter(|entry| !cache_only || entry.logical_path.root() == Root::Cache)
                .collect()
        };
        let mut found = Vec::with_capacity(candidates.len());
        for entry in candidates {
            match self.revalidate(&entry).await {
                ValidationOutcome::Valid => found.push(entry),
                ValidationOutcome::Updated(current) if current == *hash => {
                    if let Some(updated) = self.inner.index.read().await.get(&entry.logical_path.key()).cloned() {
                        found.push(updated);
                    }
                },
                ValidationOutcome::Updated(_) | ValidationOutcome::Deleted => {},
            }
        }
        found
    }

    /// Insert or replace the entry at `entry.logical_path`.
    pub async fn put(&self, entry: CacheEntry) {
        let hash = entry.hash;
        let previous = self.inner.index.write().await.insert(entry);
        if let Some(previous) = previous
            && previous.hash != hash
        {
            tracing::debug!(path = %previous.logical_path, old = %previous.hash, new = %hash, "Path now holds different content");
        }
        self.mark_dirty();
    }

    /// Forget `logical_path`, but only while it still holds `hash`.
    pub async fn remove(&self, hash: &ContentHash, logical_path: &LogicalPath) -> bool {
        let removed = self.inner.index.write().await.remove(hash, &logical_path.key()).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Check `entry` against the live file.
    ///
    /// Hashing is skipped when the modification time is unchanged. Errors
    /// reading the file count as the file being gone.
    #[instrument(skip_all, fields(path = %entry.logical_path, hash = %entry.hash))]
    pub async fn revalidate(&self, entry: &CacheEntry) -> ValidationOutcome {
        let key = entry.logical_path.key();
        let Some(resolved) = self.inner.roots.resolve(&entry.logical_path) else {
            self.remove(&entry.hash, &entry.logical_path).await;
            return ValidationOutcome::Deleted;
        };
        let metadata = match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                tracing::warn!("Indexed path is no longer a file");
                self.remove(&entry.hash, &entry.logical_path).await;
                return ValidationOutcome::Deleted;
            },
            Err(e) => {
                if e.kind() != IoErrorKind::NotFound {
                    tracing::warn!(error = %e, "Could not stat indexed file");
                }
                self.remove(&entry.hash, &entry.logical_path).await;
                return ValidationOutcome::Deleted;
            },
        };
        if metadata.modified().ok().map(ticks_of) == Some(entry.modified_ticks) {
            self.inner.index.write().await.touch(&key, now_ticks());
            return ValidationOutcome::Valid;
        }

        match inspect(entry.logical_path.clone(), resolved).await {
            Ok(Some(mut current)) => {
                if current.hash == entry.hash {
                    current.compressed_size = entry.compressed_size;
                } else {
                    tracing::info!(new = %current.hash, "File content changed");
                }
                let hash = current.hash;
                self.put(current).await;
                ValidationOutcome::Updated(hash)
            },
            Ok(None) => {
                self.remove(&entry.hash, &entry.logical_path).await;
                ValidationOutcome::Deleted
            },
            Err(err) => {
                tracing::warn!(error = ?err, "Could not rehash modified file");
                self.remove(&entry.hash, &entry.logical_path).await;
                ValidationOutcome::Deleted
            },
        }
    }

    /// Index a file that was just written, failing if its content doesn't
    /// hash to `expected`.
    ///
    /// Nothing is indexed on a mismatch; deleting the file is up to the
    /// caller.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display(), hash = %expected))]
    pub async fn record(&self, path: impl AsRef<Path>, expected: ContentHash) -> Result<CacheEntry> {
        let path = path.as_ref();
        let logical = self.logical(path).ok_or_raise(|| ErrorKind::OutsideRoots(path.to_path_buf()))?;
        let resolved = self.inner.roots.resolve(&logical).ok_or_raise(|| ErrorKind::OutsideRoots(path.to_path_buf()))?;
        let entry = inspect(logical, resolved).await?.ok_or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))?;
        if entry.hash != expected {
            exn::bail!(ErrorKind::HashMismatch(expected, entry.hash));
        }
        self.put(entry.clone()).await;
        Ok(entry)
    }

    /// Remember the compressed size of `hash` on every location holding it.
    pub async fn set_compressed_size(&self, hash: &ContentHash, size: u64) {
        if self.inner.index.write().await.set_compressed_size(hash, size) > 0 {
            self.mark_dirty();
        }
    }

    /// Snapshot of every indexed entry, without revalidating.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.inner.index.read().await.entries().cloned().collect();
        entries.sort_by_key(|entry| entry.logical_path.key());
        entries
    }

    /// Total size of everything indexed under the cache root.
    pub async fn total_size(&self) -> u64 {
        self.inner
            .index
            .read()
            .await
            .entries()
            .filter(|entry| entry.logical_path.root() == Root::Cache)
            .map(|entry| entry.size)
            .sum()
    }

    /// Delete least recently used files from the cache root until it holds at
    /// most `max_bytes`. The external root is never touched.
    #[instrument(skip(self))]
    pub async fn enforce_size_limit(&self, max_bytes: u64) -> EvictionReport {
        let candidates = self.inner.index.read().await.eviction_candidates();
        let total: u64 = candidates.iter().map(|(entry, _)| entry.size).sum();
        let mut report = EvictionReport::default();
        for entry in evict::plan(candidates, total, max_bytes) {
            match tokio::fs::remove_file(&entry.resolved_path).await {
                Ok(()) => {},
                Err(e) if e.kind() == IoErrorKind::NotFound => {},
                Err(e) => {
                    tracing::warn!(path = %entry.resolved_path.display(), error = %e, "Could not evict file");
                    continue;
                },
            }
            self.inner.index.write().await.remove(&entry.hash, &entry.logical_path.key());
            report.freed_bytes += entry.size;
            report.removed.push(entry.hash);
        }
        if !report.removed.is_empty() {
            tracing::info!(freed_bytes = report.freed_bytes, files = report.removed.len(), "Evicted cached files");
            self.mark_dirty();
        }
        report
    }

    /// Persist the index now, skipping the debounce.
    pub async fn flush(&self) -> Result<()> {
        self.inner.write_index().await
    }
}

/// Stat and hash a file. `Ok(None)` if it doesn't exist.
async fn inspect(logical_path: LogicalPath, resolved_path: PathBuf) -> Result<Option<CacheEntry>> {
    let metadata = match tokio::fs::metadata(&resolved_path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
    };
    // Taken before hashing: if the file changes underneath us, the next
    // revalidation sees a newer time and hashes again.
    let modified_ticks = metadata.modified().map(ticks_of).unwrap_or_default();
    let hash = ContentHash::of_file(&resolved_path).await?;
    Ok(Some(CacheEntry {
        hash,
        logical_path,
        resolved_path,
        size: metadata.len(),
        compressed_size: None,
        modified_ticks,
    }))
}

async fn load(path: &Path, roots: &Roots, reserved: &[String]) -> Result<(Index, usize)> {
    let mut index = Index::default();
    let Some(contents) = persist::read(path).await? else {
        tracing::debug!(path = %path.display(), "No persisted index; starting empty");
        return Ok((index, 0));
    };
    let mut dropped = 0;
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match persist::parse_line(line, roots) {
            Ok(entry) if is_bookkeeping(&entry.logical_path, reserved) => {
                tracing::warn!(line = number + 1, path = %entry.logical_path, "Skipping index entry for cache bookkeeping");
                dropped += 1;
            },
            Ok(entry) if index.contains_key(&entry.logical_path.key()) => {
                tracing::warn!(line = number + 1, path = %entry.logical_path, "Skipping duplicate index entry");
                dropped += 1;
            },
            Ok(entry) => {
                index.insert(entry);
            },
            Err(Rejected::Malformed) => {
                tracing::warn!(line = number + 1, "Skipping malformed index entry");
                dropped += 1;
            },
            Err(Rejected::Unrooted(logical_path)) => {
                tracing::warn!(line = number + 1, path = %logical_path, "Skipping index entry for unconfigured root");
                dropped += 1;
            },
        }
    }
    tracing::info!(entries = index.len(), dropped, "Loaded cache index");
    Ok((index, dropped))
}

/// Delete `<HASH>.tmp` files left behind by interrupted downloads.
async fn remove_stale_temporaries(dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await.or_raise(|| ErrorKind::Io)?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Io)? {
        let path = entry.path();
        if !path.file_name().and_then(|name| name.to_str()).is_some_and(is_partial_download) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove partial download"),
        }
    }
    Ok(removed)
}

/// `<HASH>.tmp`, as written by [`ContentCache::temp_path`].
fn is_partial_download(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(stem, extension)| {
        extension.eq_ignore_ascii_case(TEMPORARY_EXTENSION) && stem.parse::<ContentHash>().is_ok()
    })
}

fn is_bookkeeping(logical: &LogicalPath, reserved: &[String]) -> bool {
    let key = logical.key();
    reserved.contains(&key)
        || (logical.root() == Root::Cache && !logical.suffix().contains('/') && is_partial_download(logical.suffix()))
}

fn ticks_of(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos()).map_or(i64::MIN, |nanos| -nanos),
    }
}

fn now_ticks() -> i64 {
    ticks_of(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};

    struct Fixture {
        _dir: tempfile::TempDir,
        cache_dir: PathBuf,
        external_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache_dir = dir.path().join("cache");
            let external_dir = dir.path().join("mods");
            std::fs::create_dir_all(&external_dir).unwrap();
            Self { _dir: dir, cache_dir, external_dir }
        }

        fn roots(&self) -> Roots {
            Roots::new(&self.cache_dir, Some(self.external_dir.clone())).unwrap()
        }

        async fn open(&self) -> ContentCache {
            ContentCache::open(self.roots(), CacheOptions::default()).await.unwrap()
        }

        fn index_file(&self) -> PathBuf {
            self.cache_dir.join(INDEX_FILE_NAME)
        }
    }

    fn write_file(path: &Path, content: &[u8], seconds: u64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        set_mtime(path, seconds);
    }

    fn set_mtime(path: &Path, seconds: u64) {
        let time = UNIX_EPOCH + Duration::from_secs(seconds);
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(time)).unwrap();
    }

    #[tokio::test]
    async fn test_resolve_indexes_new_file() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let path = fixture.external_dir.join("Outfit").join("Shirt.mdl");
        write_file(&path, b"shirt", 1_000);

        let entry = cache.resolve(&path).await.unwrap();
        assert_eq!(entry.hash, ContentHash::of_bytes(b"shirt"));
        assert_eq!(entry.logical_path.to_string(), "{external}/Outfit/Shirt.mdl");
        assert_eq!(entry.resolved_path, path);
        assert_eq!(entry.size, 5);
        assert_eq!(entry.modified_ticks, 1_000_000_000_000);

        assert_eq!(cache.resolve(&path).await.unwrap(), entry);
        assert_eq!(cache.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_paths() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        assert!(cache.resolve(fixture.external_dir.join("missing")).await.is_none());
        assert!(cache.resolve("/definitely/not/a/root/file").await.is_none());
        assert!(cache.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_revalidate_valid_entry_matches_disk() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let path = fixture.external_dir.join("a.tex");
        write_file(&path, b"texture", 1_000);
        let entry = cache.resolve(&path).await.unwrap();

        assert_eq!(cache.revalidate(&entry).await, ValidationOutcome::Valid);
        assert_eq!(ContentHash::of_file(&entry.resolved_path).await.unwrap(), entry.hash);
    }

    #[tokio::test]
    async fn test_revalidate_modified_file() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let path = fixture.external_dir.join("a.tex");
        write_file(&path, b"before", 1_000);
        let entry = cache.resolve(&path).await.unwrap();

        write_file(&path, b"after", 2_000);
        let after = ContentHash::of_bytes(b"after");
        assert_eq!(cache.revalidate(&entry).await, ValidationOutcome::Updated(after));
        assert!(cache.by_hash(&entry.hash, false).await.is_empty());
        assert_eq!(cache.by_hash(&after, false).await.len(), 1);
    }

    #[tokio::test]
    async fn test_revalidate_deleted_file() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let path = fixture.external_dir.join("a.tex");
        write_file(&path, b"gone soon", 1_000);
        let entry = cache.resolve(&path).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        assert_eq!(cache.revalidate(&entry).await, ValidationOutcome::Deleted);
        assert!(cache.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_by_hash_excludes_changed_and_deleted_locations() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let content = b"shared";
        let hash = ContentHash::of_bytes(content);
        let kept = fixture.external_dir.join("kept");
        let changed = fixture.external_dir.join("changed");
        let deleted = fixture.external_dir.join("deleted");
        for path in [&kept, &changed, &deleted] {
            write_file(path, content, 1_000);
            cache.resolve(path).await.unwrap();
        }
        let stored = cache.content_path(&hash);
        write_file(&stored, content, 1_000);
        cache.record(&stored, hash).await.unwrap();

        write_file(&changed, b"different", 2_000);
        std::fs::remove_file(&deleted).unwrap();

        let found = cache.by_hash(&hash, false).await;
        let mut paths: Vec<_> = found.iter().map(|entry| entry.resolved_path.clone()).collect();
        paths.sort();
        let mut expected = vec![kept.clone(), stored.clone()];
        expected.sort();
        assert_eq!(paths, expected);

        let cache_only = cache.by_hash(&hash, true).await;
        assert_eq!(cache_only.len(), 1);
        assert_eq!(cache_only[0].logical_path.root(), Root::Cache);
        assert_eq!(cache.entries().await.len(), 3);
    }

    #[tokio::test]
    async fn test_put_and_remove() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let path = fixture.external_dir.join("a");
        write_file(&path, b"a", 1_000);
        let entry = cache.resolve(&path).await.unwrap();

        assert!(!cache.remove(&ContentHash::of_bytes(b"b"), &entry.logical_path).await);
        assert!(cache.remove(&entry.hash, &entry.logical_path).await);
        assert!(cache.entries().await.is_empty());

        cache.put(entry.clone()).await;
        cache.put(entry.clone()).await;
        assert_eq!(cache.entries().await, vec![entry]);
    }

    #[tokio::test]
    async fn test_record_rejects_corrupt_content() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let expected = ContentHash::of_bytes(b"expected");
        let path = cache.content_path(&expected);
        write_file(&path, b"corrupted", 1_000);

        let err = cache.record(&path, expected).await.unwrap_err();
        assert!(err.is_corruption());
        assert!(cache.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_outside_roots() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let err = cache.record("/elsewhere/file", ContentHash::of_bytes(b"")).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::OutsideRoots(_)));
    }

    #[tokio::test]
    async fn test_set_compressed_size() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let path = fixture.external_dir.join("a");
        write_file(&path, b"compress me", 1_000);
        let entry = cache.resolve(&path).await.unwrap();

        cache.set_compressed_size(&entry.hash, 7).await;
        assert_eq!(cache.resolve(&path).await.unwrap().compressed_size, Some(7));
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let external = fixture.external_dir.join("Outfit/Shirt.mdl");
        write_file(&external, b"shirt", 1_000);
        let hash = ContentHash::of_bytes(b"stored");
        let stored = cache.content_path(&hash);
        write_file(&stored, b"stored", 2_000);
        cache.resolve(&external).await.unwrap();
        cache.record(&stored, hash).await.unwrap();
        cache.set_compressed_size(&hash, 4).await;
        cache.flush().await.unwrap();
        let before = cache.entries().await;
        drop(cache);

        let reopened = fixture.open().await;
        assert_eq!(reopened.entries().await, before);
    }

    #[tokio::test]
    async fn test_debounced_write() {
        let fixture = Fixture::new();
        let options = CacheOptions { index_file: None, persist_debounce: Duration::from_millis(10) };
        let cache = ContentCache::open(fixture.roots(), options).await.unwrap();
        let path = fixture.external_dir.join("a");
        write_file(&path, b"a", 1_000);
        cache.resolve(&path).await.unwrap();

        let mut persisted = String::new();
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            persisted = std::fs::read_to_string(fixture.index_file()).unwrap_or_default();
            if !persisted.is_empty() {
                break;
            }
        }
        assert!(persisted.contains("{external}/a"));
    }

    #[tokio::test]
    async fn test_reload_drops_bad_lines_and_rewrites() {
        let fixture = Fixture::new();
        let hash = ContentHash::of_bytes(b"x");
        std::fs::create_dir_all(&fixture.cache_dir).unwrap();
        let lines = [
            format!("{hash}|{{cache}}/{hash}|1|1|"),
            format!("{hash}|{{CACHE}}/{hash}|1|1|"),
            format!("{hash}|{{cache}}/{}|1|1|", hash.to_string().to_lowercase()),
            "not|an|entry".to_string(),
            format!("{hash}|{{external}}/x|1|1|"),
        ];
        std::fs::write(fixture.index_file(), lines.join("\n")).unwrap();

        let roots = Roots::new(&fixture.cache_dir, None).unwrap();
        let cache = ContentCache::open(roots, CacheOptions::default()).await.unwrap();
        assert_eq!(cache.entries().await.len(), 1);
        let rewritten = std::fs::read_to_string(fixture.index_file()).unwrap();
        assert_eq!(rewritten, format!("{}\n", lines[0]));
    }

    #[tokio::test]
    async fn test_open_removes_partial_downloads() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(&fixture.cache_dir).unwrap();
        let hash = ContentHash::of_bytes(b"partial");
        let partial = fixture.cache_dir.join(format!("{hash}.tmp"));
        let unrelated = fixture.cache_dir.join("notes.tmp");
        std::fs::write(&partial, b"par").unwrap();
        std::fs::write(&unrelated, b"keep").unwrap();

        let cache = fixture.open().await;
        assert_eq!(cache.temp_path(&hash), partial);
        assert!(!partial.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_bookkeeping_files_are_not_content() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let hash = ContentHash::of_bytes(b"kept");
        let path = cache.content_path(&hash);
        write_file(&path, b"kept", 1_000);
        cache.record(&path, hash).await.unwrap();
        cache.flush().await.unwrap();

        let index_file = fixture.index_file();
        let backup = persist::backup_path(&index_file);
        let partial = cache.temp_path(&ContentHash::of_bytes(b"arriving"));
        write_file(&backup, b"old index", 1);
        write_file(&partial, b"half", 1);
        for path in [&index_file, &backup, &persist::writing_path(&index_file), &partial] {
            assert!(cache.resolve(path).await.is_none(), "{}", path.display());
        }
        assert!(cache.record(&index_file, ContentHash::of_file(&index_file).await.unwrap()).await.is_err());
        assert_eq!(cache.entries().await.len(), 1);

        let report = cache.enforce_size_limit(0).await;
        assert_eq!(report.removed, vec![hash]);
        assert!(index_file.exists());
    }

    #[tokio::test]
    async fn test_reload_drops_entry_for_index_file() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(&fixture.cache_dir).unwrap();
        let line = format!("{}|{{cache}}/{INDEX_FILE_NAME}|1|10|", ContentHash::of_bytes(b"index"));
        std::fs::write(fixture.index_file(), format!("{line}\n")).unwrap();

        let cache = fixture.open().await;
        assert!(cache.entries().await.is_empty());
        // Rewritten without the bad line.
        let persisted = std::fs::read_to_string(fixture.index_file()).unwrap();
        assert!(persisted.trim().is_empty());
    }

    #[tokio::test]
    async fn test_enforce_size_limit_evicts_oldest_cache_files() {
        let fixture = Fixture::new();
        let cache = fixture.open().await;
        let mut stored = Vec::new();
        for (age, content) in [(3_000, b"newest".as_slice()), (1_000, b"oldest".as_slice()), (2_000, b"middle".as_slice())] {
            let hash = ContentHash::of_bytes(content);
            let path = cache.content_path(&hash);
            write_file(&path, content, age);
            cache.record(&path, hash).await.unwrap();
            stored.push((hash, path));
        }
        let external = fixture.external_dir.join("big");
        write_file(&external, &[0u8; 1024], 1);
        cache.resolve(&external).await.unwrap();
        assert_eq!(cache.total_size().await, 18);

        let report = cache.enforce_size_limit(12).await;
        assert_eq!(report.removed, vec![ContentHash::of_bytes(b"oldest")]);
        assert_eq!(report.freed_bytes, 6);
        assert!(!stored[1].1.exists());
        assert!(stored[0].1.exists() && stored[2].1.exists());
        assert!(external.exists());
        assert_eq!(cache.total_size().await, 12);

        assert_eq!(cache.enforce_size_limit(12).await, EvictionReport::default());
    }
}
