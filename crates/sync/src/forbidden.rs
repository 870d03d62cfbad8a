use attire_cache::ContentHash;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hashes the broker refuses to serve or accept.
///
/// Sticky for the lifetime of a connection: once a hash is recorded it's
/// never requested again until [`clear`](Self::clear). Clones share state.
#[derive(Clone, Debug, Default)]
pub struct ForbiddenRegistry {
    hashes: Arc<Mutex<HashMap<ContentHash, Option<String>>>>,
}

impl ForbiddenRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ContentHash, Option<String>>> {
        self.hashes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, hash: ContentHash, forbidden_by: Option<String>) {
        if self.lock().insert(hash, forbidden_by.clone()).is_none() {
            tracing::info!(%hash, ?forbidden_by, "File forbidden by broker");
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.lock().contains_key(hash)
    }

    /// Who forbade `hash`, if it's forbidden and the broker said.
    pub fn forbidden_by(&self, hash: &ContentHash) -> Option<String> {
        self.lock().get(hash).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
