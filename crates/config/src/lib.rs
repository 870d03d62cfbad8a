//! Layered configuration.
//!
//! Values are resolved in order, later layers winning:
//! 1. Built-in defaults.
//! 2. A config file: TOML, YAML or JSON, chosen by extension. Defaults to
//!    `config.toml` in the platform's config directory, which may not exist.
//! 3. Environment variables prefixed with `ATTIRE_`, using `__` to nest, e.g.
//!    `ATTIRE_TRANSFER__PARALLEL_DOWNLOADS=4`.

pub mod error;
mod settings;

pub use crate::settings::{BrokerSettings, CacheSettings, Config, SpeedUnit, TransferSettings};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "ATTIRE_";

/// Where the config file is looked for when none is given explicitly.
pub fn default_config_file() -> Option<PathBuf> {
    settings::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// Resolve configuration from every layer and validate it.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = merge_file(figment, path)?;
            },
            None => {
                if let Some(path) = default_config_file().filter(|path| path.is_file()) {
                    figment = merge_file(figment, &path)?;
                }
            },
        }
        let config: Config =
            figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Reject configurations that parse but can't work.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.parallel_downloads == 0 {
            exn::bail!(ErrorKind::Invalid("transfer.parallel_downloads must be at least 1".into()));
        }
        if self.transfer.parallel_uploads == 0 {
            exn::bail!(ErrorKind::Invalid("transfer.parallel_uploads must be at least 1".into()));
        }
        if self.transfer.poll_interval_ms == 0 || self.transfer.queue_timeout_ms == 0 {
            exn::bail!(ErrorKind::Invalid("transfer polling intervals must be non-zero".into()));
        }
        if !self.cache.directory.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!(
                "cache.directory must be absolute: {}",
                self.cache.directory.display()
            )));
        }
        if let Some(external) = &self.cache.external_directory
            && !external.is_absolute()
        {
            exn::bail!(ErrorKind::Invalid(format!(
                "cache.external_directory must be absolute: {}",
                external.display()
            )));
        }
        if let Some(endpoint) = &self.broker.endpoint
            && !matches!(endpoint.scheme(), "http" | "https")
        {
            exn::bail!(ErrorKind::Invalid(format!("broker.endpoint must be http(s): {endpoint}")));
        }
        if self.transfer.speed_limit < 0 {
            tracing::warn!(speed_limit = self.transfer.speed_limit, "Negative speed limit; downloads are unlimited");
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    tracing::debug!(path = %path.display(), "Reading config file");
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}
