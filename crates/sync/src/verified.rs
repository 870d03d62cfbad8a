use attire_cache::ContentHash;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Hashes recently confirmed present on the broker, so repeated uploads of
/// unchanged content don't ask again. Entries expire after `ttl`.
#[derive(Clone, Debug)]
pub struct VerifiedSet {
    ttl: Duration,
    verified: Arc<Mutex<HashMap<ContentHash, Instant>>>,
}

impl VerifiedSet {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, verified: Arc::default() }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContentHash, Instant>> {
        self.verified.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, hash: ContentHash) {
        self.lock().insert(hash, Instant::now());
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        let mut verified = self.lock();
        match verified.get(hash) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                verified.remove(hash);
                false
            },
            None => false,
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
