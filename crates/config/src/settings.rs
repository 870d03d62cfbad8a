use attire_compress::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const APPLICATION: &str = "attire";

pub(crate) fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APPLICATION)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheSettings,
    pub transfer: TransferSettings,
    pub broker: BrokerSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// The content store; downloads land here.
    pub directory: PathBuf,
    /// User-managed directory of files that are observed but never evicted.
    pub external_directory: Option<PathBuf>,
    /// Evict least recently used downloads beyond this many bytes.
    pub max_size: Option<u64>,
    pub persist_debounce_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let directory = project_dirs()
            .map(|dirs| dirs.cache_dir().join("files"))
            .unwrap_or_else(|| std::env::temp_dir().join(APPLICATION).join("files"));
        Self { directory, external_directory: None, max_size: None, persist_debounce_ms: 2_000 }
    }
}

impl CacheSettings {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Unit of [`TransferSettings::speed_limit`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    #[default]
    #[serde(alias = "b")]
    Bytes,
    #[serde(alias = "kib")]
    Kibibytes,
    #[serde(alias = "mib")]
    Mebibytes,
}

impl SpeedUnit {
    pub fn bytes(&self) -> i64 {
        match self {
            Self::Bytes => 1,
            Self::Kibibytes => 1024,
            Self::Mebibytes => 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub parallel_downloads: usize,
    pub parallel_uploads: usize,
    /// Total download bandwidth, shared between active downloads. Zero (or
    /// less) means unlimited.
    pub speed_limit: i64,
    pub speed_unit: SpeedUnit,
    /// Delay between readiness checks of a queued batch.
    pub poll_interval_ms: u64,
    /// Without progress for this long, the broker is asked to keep the batch
    /// alive.
    pub queue_timeout_ms: u64,
    /// Give up on a queued batch entirely after this long.
    pub queue_max_wait_ms: u64,
    /// Skip asking the broker about recently uploaded content for this long.
    pub verified_ttl_secs: u64,
    pub compression: Compression,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            parallel_downloads: 10,
            parallel_uploads: 10,
            speed_limit: 0,
            speed_unit: SpeedUnit::Bytes,
            poll_interval_ms: 250,
            queue_timeout_ms: 5_000,
            queue_max_wait_ms: 5 * 60 * 1_000,
            verified_ttl_secs: 10 * 60,
            compression: Compression::Lz4,
        }
    }
}

impl TransferSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn queue_max_wait(&self) -> Duration {
        Duration::from_millis(self.queue_max_wait_ms)
    }

    pub fn verified_ttl(&self) -> Duration {
        Duration::from_secs(self.verified_ttl_secs)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub endpoint: Option<Url>,
    /// Bearer token sent with authenticated requests.
    pub token: Option<String>,
}
