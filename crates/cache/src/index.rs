use crate::entry::{CacheEntry, Root};
use crate::hash::ContentHash;
use std::collections::{BTreeSet, HashMap};

struct Indexed {
    entry: CacheEntry,
    /// Eviction order. Starts at the file's modification time and moves
    /// forward every time the entry is handed out.
    last_access: i64,
}

/// Two-way index: logical path key to entry, and hash to every path holding
/// that content.
///
/// A path maps to at most one entry. A hash bucket exists only while it holds
/// at least one path.
#[derive(Default)]
pub(crate) struct Index {
    by_path: HashMap<String, Indexed>,
    by_hash: HashMap<ContentHash, BTreeSet<String>>,
}

impl Index {
    pub(crate) fn len(&self) -> usize {
        self.by_path.len()
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.by_path.contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.by_path.get(key).map(|indexed| &indexed.entry)
    }

    pub(crate) fn touch(&mut self, key: &str, now: i64) {
        if let Some(indexed) = self.by_path.get_mut(key) {
            indexed.last_access = indexed.last_access.max(now);
        }
    }

    /// Upsert by logical path, returning whatever entry the path held before.
    pub(crate) fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let key = entry.logical_path.key();
        let hash = entry.hash;
        let previous = self.by_path.remove(&key);
        if let Some(previous) = &previous
            && previous.entry.hash != hash
        {
            self.unlink(&previous.entry.hash, &key);
        }
        let last_access = previous.as_ref().map_or(entry.modified_ticks, |p| p.last_access.max(entry.modified_ticks));
        self.by_hash.entry(hash).or_default().insert(key.clone());
        self.by_path.insert(key, Indexed { entry, last_access });
        previous.map(|p| p.entry)
    }

    /// Remove `key` only if it currently holds `hash`.
    pub(crate) fn remove(&mut self, hash: &ContentHash, key: &str) -> Option<CacheEntry> {
        if self.by_path.get(key)?.entry.hash != *hash {
            return None;
        }
        self.remove_key(key)
    }

    pub(crate) fn remove_key(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.by_path.remove(key)?;
        self.unlink(&removed.entry.hash, key);
        Some(removed.entry)
    }

    fn unlink(&mut self, hash: &ContentHash, key: &str) {
        if let Some(bucket) = self.by_hash.get_mut(hash) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.by_hash.remove(hash);
            }
        }
    }

    pub(crate) fn keys_for(&self, hash: &ContentHash) -> Vec<String> {
        self.by_hash.get(hash).map(|bucket| bucket.iter().cloned().collect()).unwrap_or_default()
    }

    pub(crate) fn set_compressed_size(&mut self, hash: &ContentHash, size: u64) -> usize {
        let Some(bucket) = self.by_hash.get(hash) else {
            return 0;
        };
        let mut updated = 0;
        for key in bucket {
            if let Some(indexed) = self.by_path.get_mut(key) {
                indexed.entry.compressed_size = Some(size);
                updated += 1;
            }
        }
        updated
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.by_path.values().map(|indexed| &indexed.entry)
    }

    /// Cache-root entries, least recently accessed first.
    pub(crate) fn eviction_candidates(&self) -> Vec<(CacheEntry, i64)> {
        let mut candidates: Vec<_> = self
            .by_path
            .values()
            .filter(|indexed| indexed.entry.logical_path.root() == Root::Cache)
            .map(|indexed| (indexed.entry.clone(), indexed.last_access))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.logical_path.key().cmp(&b.0.logical_path.key())));
        candidates
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (key, indexed) in &self.by_path {
            assert_eq!(*key, indexed.entry.logical_path.key());
            assert!(self.by_hash.get(&indexed.entry.hash).is_some_and(|bucket| bucket.contains(key)));
        }
        for (hash, bucket) in &self.by_hash {
            assert!(!bucket.is_empty());
            for key in bucket {
                assert_eq!(self.by_path.get(key).map(|i| i.entry.hash), Some(*hash));
            }
        }
    }
}
