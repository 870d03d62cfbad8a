use crate::entry::CacheEntry;
use crate::hash::ContentHash;

/// What [`ContentCache::enforce_size_limit`](crate::ContentCache::enforce_size_limit)
/// removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub freed_bytes: u64,
    pub removed: Vec<ContentHash>,
}

/// Pick entries to delete, oldest access first, until `total` fits within
/// `max_bytes`. `candidates` must already be sorted least recently used first.
pub(crate) fn plan(candidates: Vec<(CacheEntry, i64)>, total: u64, max_bytes: u64) -> Vec<CacheEntry> {
    let mut remaining = total;
    candidates
        .into_iter()
        .map(|(entry, _)| entry)
        .take_while(|entry| {
            if remaining <= max_bytes {
                return false;
            }
            remaining = remaining.saturating_sub(entry.size);
            true
        })
        .collect()
}
