use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::CacheOptions;
use crate::client::ClientOptions;
use crate::logging::LogFormat;
use crate::units::ByteSize;

fn default_quota_low() -> ByteSize {
    ByteSize(8 << 30)
}

fn default_quota_high() -> ByteSize {
    ByteSize(10 << 30)
}

fn default_upstream_timeout() -> u64 {
    120
}

fn default_upstream_pool_capacity() -> usize {
    32
}

fn default_maintenance_interval() -> u64 {
    900
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root directory holding the blob store (`cache/`) and the metadata
    /// store (`db/`).
    pub cache_dir: PathBuf,
    #[serde(default = "default_quota_low")]
    pub cache_quota_low: ByteSize,
    #[serde(default = "default_quota_high")]
    pub cache_quota_high: ByteSize,
    /// Whether the engine runs as a private (single-user) cache, which
    /// allows storing `Cache-Control: private` responses.
    #[serde(default)]
    pub private_cache: bool,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_upstream_pool_capacity")]
    pub upstream_pool_capacity: usize,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(config_path)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("DEPOT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval)
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            quota_low: self.cache_quota_low.bytes(),
            quota_high: self.cache_quota_high.bytes(),
            maintenance_interval: self.maintenance_interval(),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            private_cache: self.private_cache,
            timeout: self.upstream_timeout(),
            pool_max_idle_per_host: self.upstream_pool_capacity,
        }
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_quota_high.bytes() > 0,
            "cache_quota_high must be greater than 0 (got {})",
            self.cache_quota_high
        );
        ensure!(
            self.cache_quota_low < self.cache_quota_high,
            "cache_quota_low must be below cache_quota_high (got {} >= {})",
            self.cache_quota_low,
            self.cache_quota_high
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.upstream_pool_capacity > 0,
            "upstream_pool_capacity must be at least 1 (got {})",
            self.upstream_pool_capacity
        );
        ensure!(
            self.maintenance_interval > 0,
            "maintenance_interval must be greater than 0 seconds (got {})",
            self.maintenance_interval
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = config_path {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/depot/depot.toml"),
        PathBuf::from("depot.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
