//! Pushing locally cached files the broker doesn't have yet.

use crate::error::{ErrorKind, Result, raise_transfer};
use crate::forbidden::ForbiddenRegistry;
use crate::status::{TransferStatus, TransferTracker};
use crate::verified::VerifiedSet;
use attire_cache::{CacheEntry, ContentCache, ContentHash};
use attire_transfer::{FileServer, TransferKind, UploadTransport};
use bytes::Bytes;
use exn::ResultExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<ContentHash>,
    /// Already on the broker, or confirmed there recently.
    pub skipped: Vec<ContentHash>,
    /// Not in the local cache; nothing to upload.
    pub missing: Vec<ContentHash>,
    pub forbidden: Vec<ContentHash>,
    pub failed: Vec<ContentHash>,
}

/// Progress of one file in the running upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    pub hash: ContentHash,
    pub status: TransferStatus,
    pub transferred: u64,
    pub total: u64,
}

pub struct UploadCoordinator {
    files: FileServer,
    cache: ContentCache,
    forbidden: ForbiddenRegistry,
    verified: VerifiedSet,
    /// The running upload's generation and token.
    active: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
    progress: Mutex<HashMap<ContentHash, Arc<TransferTracker>>>,
}

impl UploadCoordinator {
    pub fn new(files: FileServer, cache: ContentCache, forbidden: ForbiddenRegistry, verified: VerifiedSet) -> Self {
        Self {
            files,
            cache,
            forbidden,
            verified,
            active: Mutex::default(),
            generation: AtomicU64::new(0),
            progress: Mutex::default(),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<ContentHash, Arc<TransferTracker>>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-file progress of the running upload.
    pub fn progress(&self) -> Vec<UploadProgress> {
        let mut progress: Vec<UploadProgress> = self
            .trackers()
            .iter()
            .map(|(&hash, tracker)| UploadProgress {
                hash,
                status: tracker.status(),
                transferred: tracker.progress().transferred(),
                total: tracker.progress().total(),
            })
            .collect();
        progress.sort_by_key(|file| file.hash);
        progress
    }

    /// Stop the running upload, if any, and forget its progress.
    pub fn cancel(&self) {
        if let Some((_, token)) = self.active().take() {
            tracing::info!("Cancelling upload");
            token.cancel();
        }
        self.trackers().clear();
    }

    /// Upload whichever of `hashes` the broker asks for.
    ///
    /// Starting an upload cancels the one already running. Hashes that aren't
    /// cached locally are returned in [`UploadReport::missing`].
    #[instrument(skip_all, fields(requested = hashes.len()))]
    pub async fn upload(&self, hashes: &[ContentHash]) -> Result<UploadReport> {
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.active().replace((generation, cancel.clone())) {
            previous.cancel();
        }
        let result = self.upload_inner(hashes, &cancel).await;
        let mut active = self.active();
        // A newer upload may have taken over already.
        if active.as_ref().is_some_and(|(current, _)| *current == generation) {
            *active = None;
        }
        result
    }

    async fn upload_inner(&self, hashes: &[ContentHash], cancel: &CancellationToken) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let mut seen = HashSet::new();
        let mut present: Vec<CacheEntry> = Vec::new();
        for &hash in hashes.iter().filter(|hash| seen.insert(**hash)) {
            if self.forbidden.contains(&hash) {
                report.forbidden.push(hash);
            } else if self.verified.contains(&hash) {
                report.skipped.push(hash);
            } else {
                match self.cache.by_hash(&hash, false).await.into_iter().next() {
                    Some(entry) => present.push(entry),
                    None => report.missing.push(hash),
                }
            }
        }
        if !report.missing.is_empty() {
            tracing::info!(missing = report.missing.len(), "Some files aren't cached locally");
        }
        if present.is_empty() {
            return Ok(report);
        }

        let asked: Vec<ContentHash> = present.iter().map(|entry| entry.hash).collect();
        let candidates = match self.files.files_send(&asked, cancel).await {
            Ok(candidates) => candidates,
            Err(err) => {
                let kind = if *err == attire_transfer::error::ErrorKind::Cancelled {
                    ErrorKind::Cancelled
                } else {
                    ErrorKind::Broker
                };
                return Err(err).or_raise(|| kind);
            },
        };
        let mut needed = HashSet::new();
        for candidate in candidates {
            if !asked.contains(&candidate.hash) {
                tracing::warn!(hash = %candidate.hash, "Broker asked for a file that wasn't offered");
            } else if candidate.forbidden {
                self.forbidden.insert(candidate.hash, candidate.forbidden_by);
                report.forbidden.push(candidate.hash);
            } else {
                needed.insert(candidate.hash);
            }
        }

        let mut uploads = Vec::new();
        for entry in present {
            if needed.contains(&entry.hash) {
                uploads.push(entry);
            } else if !self.forbidden.contains(&entry.hash) {
                self.verified.insert(entry.hash);
                report.skipped.push(entry.hash);
            }
        }

        let concurrency = self.files.orchestrator().settings().parallel_uploads.max(1);
        let mut pending: Vec<_> = uploads.into_iter().map(|entry| self.upload_file(entry, cancel)).collect();
        let mut running = FuturesUnordered::new();
        running.extend(pending.drain(..concurrency.min(pending.len())));
        while let Some((hash, result)) = running.next().await {
            match result {
                Ok(()) => {
                    self.verified.insert(hash);
                    report.uploaded.push(hash);
                },
                Err(err) if *err == ErrorKind::Cancelled => {},
                Err(err) => {
                    tracing::warn!(%hash, error = ?err, "Upload failed");
                    report.failed.push(hash);
                },
            }
            // Pop-n-push, but FIFO instead of LIFO.
            if !pending.is_empty() {
                running.push(pending.remove(0));
            }
        }
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        tracing::info!(
            uploaded = report.uploaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Upload finished"
        );
        Ok(report)
    }

    async fn upload_file(&self, entry: CacheEntry, cancel: &CancellationToken) -> (ContentHash, Result<()>) {
        let hash = entry.hash;
        let tracker = Arc::new(TransferTracker::new(0));
        self.trackers().insert(hash, Arc::clone(&tracker));
        let result = self.send_file(&entry, &tracker, cancel).await;
        self.trackers().remove(&hash);
        (hash, result)
    }

    #[instrument(skip_all, fields(hash = %entry.hash, path = %entry.resolved_path.display()))]
    async fn send_file(&self, entry: &CacheEntry, tracker: &TransferTracker, cancel: &CancellationToken) -> Result<()> {
        let orchestrator = self.files.orchestrator();
        tracker.advance(TransferStatus::WaitingForSlot);
        let _slot = raise_transfer(orchestrator.acquire(TransferKind::Upload, cancel).await)?;

        let content = tokio::fs::read(&entry.resolved_path).await.or_raise(|| ErrorKind::Storage)?;
        let compression = orchestrator.settings().compression;
        let compressed = Bytes::from(compression.compress(&content).or_raise(|| ErrorKind::Storage)?);
        self.cache.set_compressed_size(&entry.hash, compressed.len() as u64).await;
        tracker.progress().set_total(compressed.len() as u64);
        tracker.advance(TransferStatus::Uploading);

        let plain = self
            .files
            .upload(&entry.hash, compressed.clone(), UploadTransport::Plain, tracker.progress(), cancel)
            .await;
        match plain {
            Ok(()) => {},
            Err(err) if *err == attire_transfer::error::ErrorKind::Network => {
                tracing::warn!(error = ?err, "Plain upload failed; retrying munged");
                let retry = tracker.restart_progress(compressed.len() as u64);
                let munged =
                    self.files.upload(&entry.hash, compressed, UploadTransport::Munged, retry, cancel).await;
                raise_transfer(munged)?;
            },
            Err(err) => return raise_transfer(Err(err)),
        }
        tracker.advance(TransferStatus::Done);
        tracing::debug!(bytes = tracker.progress().total(), "Uploaded file");
        Ok(())
    }

    /// Ask the broker to delete everything this user uploaded.
    #[instrument(skip_all)]
    pub async fn delete_all_files(&self, cancel: &CancellationToken) -> Result<()> {
        raise_transfer(self.files.delete_all(cancel).await)?;
        self.verified.clear();
        tracing::info!("Deleted all uploaded files");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attire_cache::{CacheOptions, Roots};
    use attire_config::TransferSettings;
    use attire_transfer::{EventBus, StaticToken, TransferOrchestrator};
    use std::time::Duration;
    use tokio::sync::watch;

    async fn coordinator() -> (tempfile::TempDir, UploadCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let roots = Roots::new(dir.path().join("cache"), None).unwrap();
        let cache = ContentCache::open(roots, CacheOptions::default()).await.unwrap();
        let (_sender, receiver) = watch::channel(TransferSettings::default());
        let orchestrator =
            Arc::new(TransferOrchestrator::new(receiver, Arc::new(StaticToken::default()), EventBus::default()));
        let coordinator = UploadCoordinator::new(
            FileServer::new(orchestrator),
            cache,
            ForbiddenRegistry::default(),
            VerifiedSet::new(Duration::from_secs(600)),
        );
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_missing_files_are_reported() {
        let (_dir, coordinator) = coordinator().await;
        let missing = ContentHash::of_bytes(b"never cached");
        // Nothing present, so the broker isn't asked.
        let report = coordinator.upload(&[missing, missing]).await.unwrap();
        assert_eq!(report, UploadReport { missing: vec![missing], ..UploadReport::default() });
    }

    #[tokio::test]
    async fn test_known_forbidden_and_verified_are_not_offered() {
        let (_dir, coordinator) = coordinator().await;
        let forbidden = ContentHash::of_bytes(b"forbidden");
        let verified = ContentHash::of_bytes(b"verified");
        coordinator.forbidden.insert(forbidden, None);
        coordinator.verified.insert(verified);
        let report = coordinator.upload(&[forbidden, verified]).await.unwrap();
        assert_eq!(report.forbidden, vec![forbidden]);
        assert_eq!(report.skipped, vec![verified]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_dir, coordinator) = coordinator().await;
        coordinator.cancel();
        coordinator.cancel();
        assert!(coordinator.progress().is_empty());
    }
}
