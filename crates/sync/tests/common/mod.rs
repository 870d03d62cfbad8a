#![allow(dead_code)]

use attire_cache::{CacheOptions, ContentCache, ContentHash, Roots};
use attire_compress::Compression;
use attire_config::TransferSettings;
use attire_container::ContainerWriter;
use attire_sync::Session;
use attire_transfer::{EventBus, StaticToken, TransferOrchestrator};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;
use url::Url;
use wiremock::MockServer;

pub struct Harness {
    pub dir: TempDir,
    pub server: MockServer,
    pub session: Session,
    pub settings: watch::Sender<TransferSettings>,
}

impl Harness {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let roots = Roots::new(dir.path().join("cache"), Some(dir.path().join("mods"))).unwrap();
        let cache = ContentCache::open(roots, CacheOptions::default()).await.unwrap();
        // Short enough that keep-alives answer quickly.
        let settings = TransferSettings { poll_interval_ms: 5, queue_timeout_ms: 20, ..TransferSettings::default() };
        let (sender, receiver) = watch::channel(settings);
        let tokens = Arc::new(StaticToken::new(Some("token".to_string())));
        let orchestrator = Arc::new(TransferOrchestrator::new(receiver, tokens, EventBus::default()));
        let session = Session::new(orchestrator, cache);
        session.connect(Url::parse(&server.uri()).unwrap());
        Self { dir, server, session, settings: sender }
    }

    pub fn url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    pub fn cache(&self) -> &ContentCache {
        self.session.cache()
    }
}

/// Deterministic, mildly compressible file content.
pub fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i / 7) as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn hash_of(content: &[u8]) -> ContentHash {
    ContentHash::of_bytes(content)
}

pub fn compressed(content: &[u8]) -> Vec<u8> {
    Compression::Lz4.compress(content).unwrap()
}

/// A munged container holding `files`, each under the hash given.
pub fn container(files: &[(ContentHash, &[u8])]) -> Vec<u8> {
    let mut writer = ContainerWriter::munged(Vec::new());
    for (hash, content) in files {
        writer.push(&hash.to_string(), &compressed(content)).unwrap();
    }
    writer.finish()
}
