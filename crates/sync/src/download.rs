//! Fetching missing files from the broker into the cache.
//!
//! Files the broker hands out a direct URL for are fetched one per request.
//! Everything else is grouped by the host serving it, queued there, and
//! streamed back as one munged block container once the queue says it's
//! ready. Every group holds a download slot for its whole lifetime, so the
//! bandwidth budget is shared by exactly the groups moving bytes.

use crate::error::{ErrorKind, Result, raise_transfer};
use crate::forbidden::ForbiddenRegistry;
use crate::status::{TransferStatus, TransferTracker};
use crate::store::{discard, store};
use attire_asyncutils::ProgressReader;
use attire_cache::{ContentCache, ContentHash};
use attire_container::{Block, ContainerReader};
use attire_transfer::{Event, FileServer, ScanGate, TransferKind};
use exn::ResultExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

/// How long a best-effort remote cancel may take.
const REMOTE_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a file will be fetched from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteLocator {
    Direct(Url),
    /// Queued and fetched as part of a container from this host.
    Batched { host: Url },
}

/// One file to download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub hash: ContentHash,
    pub locator: RemoteLocator,
    /// Compressed size, as reported by the broker.
    pub expected_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: Vec<ContentHash>,
    /// Refused by the broker, now or earlier in this connection.
    pub forbidden: Vec<ContentHash>,
    /// Already being fetched by another call; they'll land in the cache when
    /// that call finishes.
    pub in_progress: Vec<ContentHash>,
    /// Everything else that was requested and isn't in the cache now.
    pub failed: Vec<ContentHash>,
}

/// Progress of one in-flight transfer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    pub id: u64,
    pub status: TransferStatus,
    pub files: usize,
    pub transferred: u64,
    pub total: u64,
}

struct TransferGroup {
    id: u64,
    source: GroupSource,
    requests: Vec<TransferRequest>,
}

enum GroupSource {
    Direct(Url),
    Batched(Url),
}

#[derive(Default)]
struct GroupOutcome {
    downloaded: Vec<ContentHash>,
    failed: Vec<ContentHash>,
}

impl GroupOutcome {
    fn failed(hashes: impl IntoIterator<Item = ContentHash>) -> Self {
        Self { downloaded: Vec::new(), failed: hashes.into_iter().collect() }
    }
}

#[derive(Default)]
struct InFlight {
    hashes: HashSet<ContentHash>,
    groups: HashMap<u64, (usize, Arc<TransferTracker>)>,
}

/// Queued request ids being waited on, and whether the hub has said each is
/// ready. Word about any other id is dropped.
#[derive(Default)]
struct Readiness {
    waiting: Mutex<HashMap<String, bool>>,
    changed: Notify,
}

impl Readiness {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start listening for `request_id`; stops when the guard drops.
    fn expect<'a>(&'a self, request_id: &'a str) -> Awaiting<'a> {
        self.lock().entry(request_id.to_string()).or_insert(false);
        Awaiting { readiness: self, request_id }
    }

    fn mark(&self, request_id: &str) -> bool {
        match self.lock().get_mut(request_id) {
            Some(ready) => *ready = true,
            None => return false,
        }
        self.changed.notify_waiters();
        true
    }

    fn is_ready(&self, request_id: &str) -> bool {
        self.lock().get(request_id).copied().unwrap_or(false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct Awaiting<'a> {
    readiness: &'a Readiness,
    request_id: &'a str,
}

impl Drop for Awaiting<'_> {
    fn drop(&mut self) {
        self.readiness.lock().remove(self.request_id);
    }
}

pub struct DownloadCoordinator {
    files: FileServer,
    cache: ContentCache,
    forbidden: ForbiddenRegistry,
    scan: Arc<ScanGate>,
    readiness: Readiness,
    in_flight: Mutex<InFlight>,
    next_group: AtomicU64,
}

impl DownloadCoordinator {
    pub fn new(files: FileServer, cache: ContentCache, forbidden: ForbiddenRegistry, scan: Arc<ScanGate>) -> Self {
        Self {
            files,
            cache,
            forbidden,
            scan,
            readiness: Readiness::default(),
            in_flight: Mutex::default(),
            next_group: AtomicU64::new(1),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The hub pushed word that a queued batch can be fetched.
    pub fn mark_ready(&self, request_id: &str) {
        if self.readiness.mark(request_id) {
            tracing::debug!(request_id, "Queued download ready");
        } else {
            tracing::debug!(request_id, "Ignoring readiness of a request nobody is waiting for");
        }
    }

    /// Snapshot of every group currently being worked on.
    pub fn status(&self) -> Vec<GroupStatus> {
        let mut groups: Vec<GroupStatus> = self
            .in_flight()
            .groups
            .iter()
            .map(|(&id, (files, tracker))| GroupStatus {
                id,
                status: tracker.status(),
                files: *files,
                transferred: tracker.progress().transferred(),
                total: tracker.progress().total(),
            })
            .collect();
        groups.sort_by_key(|group| group.id);
        groups
    }

    /// Forget every in-flight hash and group. Used after any failure: the
    /// progress of the requested set can no longer be trusted.
    fn clear_in_flight(&self) {
        let mut in_flight = self.in_flight();
        in_flight.hashes.clear();
        in_flight.groups.clear();
    }

    /// Ask the broker about `hashes` and turn what it can serve into transfer
    /// requests.
    ///
    /// Hashes that are known forbidden, or already being downloaded, aren't
    /// asked about. Newly forbidden ones are recorded and left out.
    #[instrument(skip_all, fields(requested = hashes.len()))]
    pub async fn initiate(&self, hashes: &[ContentHash], cancel: &CancellationToken) -> Result<Vec<TransferRequest>> {
        let wanted: Vec<ContentHash> = {
            let in_flight = self.in_flight();
            let mut seen = HashSet::new();
            hashes
                .iter()
                .copied()
                .filter(|hash| seen.insert(*hash))
                .filter(|hash| !self.forbidden.contains(hash) && !in_flight.hashes.contains(hash))
                .collect()
        };
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let remote = match self.files.get_sizes(&wanted, cancel).await {
            Ok(remote) => remote,
            Err(err) => {
                let kind = if *err == attire_transfer::error::ErrorKind::Cancelled {
                    ErrorKind::Cancelled
                } else {
                    ErrorKind::Broker
                };
                return Err(err).or_raise(|| kind);
            },
        };
        let broker = self.files.orchestrator().endpoint().or_raise(|| ErrorKind::Broker)?;

        let wanted: HashSet<ContentHash> = wanted.into_iter().collect();
        let mut answered = HashSet::new();
        let mut requests = Vec::new();
        for file in remote {
            if !wanted.contains(&file.hash) || !answered.insert(file.hash) {
                tracing::warn!(hash = %file.hash, "Broker answered for a file that wasn't asked about");
                continue;
            }
            if file.forbidden {
                self.forbidden.insert(file.hash, file.forbidden_by);
                continue;
            }
            let locator = match file.direct_url {
                Some(url) => RemoteLocator::Direct(url),
                None => RemoteLocator::Batched { host: file.host.unwrap_or_else(|| broker.clone()) },
            };
            requests.push(TransferRequest { hash: file.hash, locator, expected_size: file.size });
        }
        for hash in wanted.difference(&answered) {
            tracing::warn!(%hash, "Broker doesn't know about file");
        }
        Ok(requests)
    }

    fn partition(&self, requests: Vec<TransferRequest>) -> Vec<TransferGroup> {
        let mut groups = Vec::new();
        let mut batches: Vec<(Url, Vec<TransferRequest>)> = Vec::new();
        for request in requests {
            match &request.locator {
                RemoteLocator::Direct(url) => {
                    let source = GroupSource::Direct(url.clone());
                    groups.push((source, vec![request]));
                },
                RemoteLocator::Batched { host } => match batches.iter_mut().find(|(existing, _)| existing == host) {
                    Some((_, batch)) => batch.push(request),
                    None => batches.push((host.clone(), vec![request])),
                },
            }
        }
        groups.extend(batches.into_iter().map(|(host, requests)| (GroupSource::Batched(host), requests)));
        groups
            .into_iter()
            .map(|(source, requests)| TransferGroup {
                id: self.next_group.fetch_add(1, Ordering::Relaxed),
                source,
                requests,
            })
            .collect()
    }

    /// Download every one of `hashes` the broker will serve into the cache.
    ///
    /// Failures of individual files or groups are reported, not returned.
    /// The call itself only fails when it's cancelled, or when the broker
    /// can't be asked about the set or a batch can't be queued; in the
    /// latter case every group still running is stopped.
    #[instrument(skip_all, fields(requested = hashes.len()))]
    pub async fn download_files(&self, hashes: &[ContentHash], cancel: &CancellationToken) -> Result<DownloadReport> {
        let mut requested = Vec::new();
        let mut seen = HashSet::new();
        requested.extend(hashes.iter().copied().filter(|hash| seen.insert(*hash)));
        let elsewhere: HashSet<ContentHash> = {
            let in_flight = self.in_flight();
            requested.iter().copied().filter(|hash| in_flight.hashes.contains(hash)).collect()
        };
        let fresh: Vec<ContentHash> = requested.iter().copied().filter(|hash| !elsewhere.contains(hash)).collect();

        let requests = match self.initiate(&fresh, cancel).await {
            Ok(requests) => requests,
            Err(err) => {
                self.clear_in_flight();
                return Err(err);
            },
        };

        let mut report = DownloadReport::default();
        if !requests.is_empty() {
            self.in_flight().hashes.extend(requests.iter().map(|request| request.hash));
            let events = self.files.orchestrator().events().clone();
            events.publish(Event::DownloadStarted { files: requests.len() });
            let mine: Vec<ContentHash> = requests.iter().map(|request| request.hash).collect();

            let result = {
                let _hold = self.scan.hold("download");
                self.run_groups(self.partition(requests), cancel).await
            };
            match &result {
                Ok(outcome) if outcome.failed.is_empty() => {
                    let mut in_flight = self.in_flight();
                    for hash in &mine {
                        in_flight.hashes.remove(hash);
                    }
                },
                _ => self.clear_in_flight(),
            }
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    events.publish(Event::DownloadFinished { downloaded: 0, failed: mine.len() });
                    return Err(err);
                },
            };
            events.publish(Event::DownloadFinished {
                downloaded: outcome.downloaded.len(),
                failed: outcome.failed.len(),
            });
            report.downloaded = outcome.downloaded;
        }

        let downloaded: HashSet<ContentHash> = report.downloaded.iter().copied().collect();
        for hash in requested {
            if self.forbidden.contains(&hash) {
                report.forbidden.push(hash);
            } else if elsewhere.contains(&hash) {
                report.in_progress.push(hash);
            } else if !downloaded.contains(&hash) {
                report.failed.push(hash);
            }
        }
        tracing::info!(
            downloaded = report.downloaded.len(),
            forbidden = report.forbidden.len(),
            in_progress = report.in_progress.len(),
            failed = report.failed.len(),
            "Download finished"
        );
        Ok(report)
    }

    /// Run every group, at most as many at once as there are download slots.
    async fn run_groups(&self, groups: Vec<TransferGroup>, cancel: &CancellationToken) -> Result<GroupOutcome> {
        let abort = cancel.child_token();
        let concurrency = self.files.orchestrator().settings().parallel_downloads.max(1);
        let mut pending: Vec<_> = groups.into_iter().map(|group| self.run_group(group, &abort)).collect();
        let mut running = FuturesUnordered::new();
        running.extend(pending.drain(..concurrency.min(pending.len())));

        let mut combined = GroupOutcome::default();
        let mut fatal = None;
        while let Some(result) = running.next().await {
            match result {
                Ok(outcome) => {
                    combined.downloaded.extend(outcome.downloaded);
                    combined.failed.extend(outcome.failed);
                },
                Err(err) => {
                    if fatal.is_none() {
                        // Stop the siblings; the whole set is abandoned.
                        abort.cancel();
                        fatal = Some(err);
                    }
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
        match fatal {
            Some(err) => Err(err),
            None => Ok(combined),
        }
    }

    async fn run_group(&self, group: TransferGroup, cancel: &CancellationToken) -> Result<GroupOutcome> {
        let total = group.requests.iter().map(|request| request.expected_size).sum();
        let tracker = Arc::new(TransferTracker::new(total));
        self.in_flight().groups.insert(group.id, (group.requests.len(), Arc::clone(&tracker)));
        tracker.advance(TransferStatus::WaitingForSlot);

        let result = match group.source {
            GroupSource::Direct(url) => self.run_direct(&url, &group.requests, &tracker, cancel).await,
            GroupSource::Batched(host) => self.run_batched(&host, &group.requests, &tracker, cancel).await,
        };
        self.in_flight().groups.remove(&group.id);
        result
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn run_direct(
        &self,
        url: &Url,
        requests: &[TransferRequest],
        tracker: &TransferTracker,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome> {
        let orchestrator = self.files.orchestrator();
        let _slot = raise_transfer(orchestrator.acquire(TransferKind::Download, cancel).await)?;
        let mut outcome = GroupOutcome::default();
        for request in requests {
            tracker.advance(TransferStatus::Downloading);
            match self.fetch_direct(url, request.hash, tracker, cancel).await {
                Ok(()) => outcome.downloaded.push(request.hash),
                Err(err) if *err == ErrorKind::Cancelled => return Err(err),
                Err(err) => {
                    tracing::warn!(hash = %request.hash, error = ?err, "Direct download failed");
                    outcome.failed.push(request.hash);
                },
            }
        }
        if outcome.failed.is_empty() {
            tracker.advance(TransferStatus::Done);
        }
        Ok(outcome)
    }

    async fn fetch_direct(
        &self,
        url: &Url,
        hash: ContentHash,
        tracker: &TransferTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let temp = self.cache.temp_path(&hash);
        let result: Result<attire_cache::CacheEntry> = async {
            let reader = raise_transfer(self.files.direct(url, cancel).await)?;
            let mut reader = ProgressReader::new(reader, tracker.progress());
            let mut file = tokio::fs::File::create(&temp).await.or_raise(|| ErrorKind::Storage)?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                copied = tokio::io::copy(&mut reader, &mut file) => copied.or_raise(|| ErrorKind::Transfer)?,
            };
            file.flush().await.or_raise(|| ErrorKind::Storage)?;
            drop(file);

            tracker.advance(TransferStatus::Decompressing);
            let compressed = tokio::fs::read(&temp).await.or_raise(|| ErrorKind::Storage)?;
            let compression = self.files.orchestrator().settings().compression;
            let content = compression.decompress(&compressed).or_raise(|| ErrorKind::Corruption(hash))?;
            store(&self.cache, hash, &content).await
        }
        .await;
        match result {
            Ok(entry) => {
                tracing::debug!(%hash, size = entry.size, "Downloaded file");
                Ok(())
            },
            Err(err) => {
                discard(&temp).await;
                Err(err)
            },
        }
    }

    #[instrument(skip_all, fields(%host, files = requests.len()))]
    async fn run_batched(
        &self,
        host: &Url,
        requests: &[TransferRequest],
        tracker: &TransferTracker,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome> {
        let orchestrator = self.files.orchestrator();
        let _slot = raise_transfer(orchestrator.acquire(TransferKind::Download, cancel).await)?;
        let hashes: Vec<ContentHash> = requests.iter().map(|request| request.hash).collect();

        let request_id = match self.files.enqueue(host, &hashes, cancel).await {
            Ok(request_id) => request_id,
            Err(err) => {
                let kind = if *err == attire_transfer::error::ErrorKind::Cancelled {
                    ErrorKind::Cancelled
                } else {
                    ErrorKind::Broker
                };
                return Err(err).or_raise(|| kind);
            },
        };
        tracing::debug!(%request_id, "Batch queued");
        tracker.advance(TransferStatus::WaitingForQueue);

        if let Err(err) = self.wait_until_ready(host, &request_id, cancel).await {
            self.cancel_remote(host, &request_id).await;
            if *err == ErrorKind::Cancelled {
                return Err(err);
            }
            tracing::warn!(%request_id, error = ?err, "Batch never became ready");
            return Ok(GroupOutcome::failed(hashes));
        }

        tracker.advance(TransferStatus::Downloading);
        let reader = match self.files.container(host, &request_id, cancel).await {
            Ok(reader) => reader,
            Err(err) if *err == attire_transfer::error::ErrorKind::Cancelled => {
                return raise_transfer(Err(err));
            },
            Err(err) => {
                tracing::warn!(%request_id, error = ?err, "Could not fetch batch");
                return Ok(GroupOutcome::failed(hashes));
            },
        };
        let mut container = ContainerReader::munged(ProgressReader::new(reader, tracker.progress()));

        let mut pending: HashSet<ContentHash> = hashes.iter().copied().collect();
        let mut outcome = GroupOutcome::default();
        loop {
            if tracker.status() == TransferStatus::Decompressing {
                tracker.advance(TransferStatus::Downloading);
            }
            let block = tokio::select! {
                biased;
                _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                block = container.next_block() => block,
            };
            let block = match block {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(err) => {
                    // Framing is gone; nothing after this point can be found.
                    tracing::warn!(%request_id, blocks = container.blocks_read(), error = ?err, "Corrupt batch");
                    break;
                },
            };
            tracker.advance(TransferStatus::Decompressing);
            let Some(hash) = self.claim(&block, &mut pending) else {
                continue;
            };
            match self.unpack(hash, &block).await {
                Ok(()) => outcome.downloaded.push(hash),
                Err(err) => {
                    tracing::warn!(%hash, error = ?err, "Discarding file from batch");
                    outcome.failed.push(hash);
                },
            }
        }
        if tracker.status() == TransferStatus::Downloading {
            tracker.advance(TransferStatus::Decompressing);
        }
        tracker.advance(TransferStatus::Done);

        if !pending.is_empty() {
            tracing::warn!(%request_id, missing = pending.len(), "Batch ended without some files");
        }
        // Keep the caller's order for whatever never arrived.
        outcome.failed.extend(hashes.into_iter().filter(|hash| pending.contains(hash)));
        Ok(outcome)
    }

    /// The hash a block claims to be, if it's one this batch is waiting for.
    fn claim(&self, block: &Block, pending: &mut HashSet<ContentHash>) -> Option<ContentHash> {
        let Ok(hash) = block.hash().parse::<ContentHash>() else {
            tracing::warn!(hash = block.hash(), "Batch contains an unreadable hash");
            return None;
        };
        if !pending.remove(&hash) {
            tracing::warn!(%hash, "Batch contains a file that wasn't requested");
            return None;
        }
        Some(hash)
    }

    async fn unpack(&self, hash: ContentHash, block: &Block) -> Result<()> {
        let compression = self.files.orchestrator().settings().compression;
        let content = block.decompress(compression).or_raise(|| ErrorKind::Corruption(hash))?;
        let entry = store(&self.cache, hash, &content).await?;
        tracing::debug!(%hash, size = entry.size, "Unpacked file from batch");
        Ok(())
    }

    /// Wait for the hub (or the broker's keep-alive answer) to report the
    /// batch ready. The keep-alive is sent each time the rolling timeout
    /// window passes without news.
    async fn wait_until_ready(&self, host: &Url, request_id: &str, cancel: &CancellationToken) -> Result<()> {
        let _awaiting = self.readiness.expect(request_id);
        let settings = self.files.orchestrator().settings();
        let started = Instant::now();
        let mut window = started;
        loop {
            if self.readiness.is_ready(request_id) {
                return Ok(());
            }
            if started.elapsed() >= settings.queue_max_wait() {
                exn::bail!(ErrorKind::QueueTimeout(request_id.to_string()));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                _ = self.readiness.changed.notified() => {},
                _ = tokio::time::sleep(settings.poll_interval()) => {},
            }
            if window.elapsed() < settings.queue_timeout() {
                continue;
            }
            window = Instant::now();
            match self.files.check_queue(host, request_id, cancel).await {
                Ok(true) => return Ok(()),
                Ok(false) => tracing::trace!(request_id, "Batch still queued"),
                Err(err) if *err == attire_transfer::error::ErrorKind::Cancelled => return raise_transfer(Err(err)),
                Err(err) => tracing::warn!(request_id, error = ?err, "Queue keep-alive failed"),
            }
        }
    }

    /// Tell the host to drop a queued batch. Failures are only logged; the
    /// caller is already giving up on it.
    async fn cancel_remote(&self, host: &Url, request_id: &str) {
        let cancel = CancellationToken::new();
        match tokio::time::timeout(REMOTE_CANCEL_TIMEOUT, self.files.cancel(host, request_id, &cancel)).await {
            Ok(Ok(())) => tracing::debug!(request_id, "Cancelled queued batch"),
            Ok(Err(err)) => tracing::warn!(request_id, error = ?err, "Could not cancel queued batch"),
            Err(_) => tracing::warn!(request_id, "Timed out cancelling queued batch"),
        }
    }
}
