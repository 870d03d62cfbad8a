use crate::download::DownloadCoordinator;
use crate::error::{ErrorKind, Result};
use crate::forbidden::ForbiddenRegistry;
use crate::upload::UploadCoordinator;
use crate::verified::VerifiedSet;
use attire_cache::ContentCache;
use attire_transfer::{Event, FileServer, ScanGate, TransferOrchestrator};
use exn::ResultExt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

/// One client's view of the broker: the cache, the orchestrator and both
/// coordinators, plus the state whose lifetime is a connection.
pub struct Session {
    orchestrator: Arc<TransferOrchestrator>,
    cache: ContentCache,
    forbidden: ForbiddenRegistry,
    verified: VerifiedSet,
    scan: Arc<ScanGate>,
    downloads: Arc<DownloadCoordinator>,
    uploads: Arc<UploadCoordinator>,
}

impl Session {
    pub fn new(orchestrator: Arc<TransferOrchestrator>, cache: ContentCache) -> Self {
        let files = FileServer::new(Arc::clone(&orchestrator));
        let forbidden = ForbiddenRegistry::default();
        let verified = VerifiedSet::new(orchestrator.settings().verified_ttl());
        let scan = Arc::new(ScanGate::new(orchestrator.events().clone()));
        let downloads = Arc::new(DownloadCoordinator::new(
            files.clone(),
            cache.clone(),
            forbidden.clone(),
            Arc::clone(&scan),
        ));
        let uploads = Arc::new(UploadCoordinator::new(files, cache.clone(), forbidden.clone(), verified.clone()));
        Self { orchestrator, cache, forbidden, verified, scan, downloads, uploads }
    }

    pub fn orchestrator(&self) -> &Arc<TransferOrchestrator> {
        &self.orchestrator
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn forbidden(&self) -> &ForbiddenRegistry {
        &self.forbidden
    }

    pub fn scan_gate(&self) -> &Arc<ScanGate> {
        &self.scan
    }

    pub fn downloads(&self) -> &Arc<DownloadCoordinator> {
        &self.downloads
    }

    pub fn uploads(&self) -> &Arc<UploadCoordinator> {
        &self.uploads
    }

    pub fn connect(&self, endpoint: Url) {
        self.orchestrator.connected(endpoint);
    }

    /// Drop the connection and everything learned through it.
    pub fn disconnect(&self) {
        self.uploads.cancel();
        self.forbidden.clear();
        self.verified.clear();
        self.orchestrator.disconnected();
    }

    /// Forward readiness pushed by the hub to the download coordinator, for
    /// as long as the session lives. Requires a running runtime.
    pub fn listen_for_ready(&self) {
        let mut events = self.orchestrator.events().subscribe();
        let downloads = Arc::downgrade(&self.downloads);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::DownloadReady { request_id }) => {
                        let Some(downloads) = downloads.upgrade() else {
                            break;
                        };
                        downloads.mark_ready(&request_id);
                    },
                    Ok(_) => {},
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Write out anything pending. Call before exiting.
    pub async fn shutdown(&self) -> Result<()> {
        self.uploads.cancel();
        self.cache.flush().await.or_raise(|| ErrorKind::Storage)
    }
}
