use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ingest::parse::DEFAULT_MAX_MESSAGE_SIZE;

/// Top-level configuration for the aggregator.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Agent-facing TCP ingest configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Aggregation window configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Artifact storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Agent-facing TCP ingest configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Listen address for agent connections. Default: "0.0.0.0:7070".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Largest accepted recording chunk in bytes. Default: 1MiB.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Socket read buffer size in bytes. Default: 64KiB.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

/// Aggregation window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Width of one aggregation bucket. Default: 30m.
    #[serde(default = "default_window_duration", with = "humantime_serde")]
    pub window_duration: Duration,

    /// How often elapsed buckets are finalized. Default: 10s.
    #[serde(default = "default_rotation_check_interval", with = "humantime_serde")]
    pub rotation_check_interval: Duration,
}

/// Which blob store holds finalized windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Fs,
}

/// Artifact storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend kind. Default: memory.
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    /// Root directory for the fs backend.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,

    /// Key prefix for every artifact. Default: "profiles".
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Attempts per window before a server-side failure drops it. Default: 4.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry, doubled after each one. Default: 200ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_window_duration() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_rotation_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::Memory
}

fn default_prefix() -> String {
    "profiles".to_string()
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ingest: IngestConfig::default(),
            aggregation: AggregationConfig::default(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_message_size: default_max_message_size(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_duration: default_window_duration(),
            rotation_check_interval: default_rotation_check_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root_dir: None,
            prefix: default_prefix(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Log filter to use: the command-line value when given, otherwise the
    /// configured `log_level`.
    pub fn effective_log_level<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.unwrap_or(&self.log_level)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.listen_addr.is_empty() {
            bail!("ingest.listen_addr is required");
        }

        if self.ingest.max_message_size == 0 {
            bail!("ingest.max_message_size must be positive");
        }

        if self.ingest.read_buffer_size == 0 {
            bail!("ingest.read_buffer_size must be positive");
        }

        if self.aggregation.window_duration < Duration::from_secs(1) {
            bail!("aggregation.window_duration must be at least 1s");
        }

        if self.aggregation.window_duration.subsec_nanos() != 0 {
            bail!("aggregation.window_duration must be a whole number of seconds");
        }

        if u32::try_from(self.aggregation.window_duration.as_secs()).is_err() {
            bail!("aggregation.window_duration is too large");
        }

        if self.aggregation.rotation_check_interval.is_zero() {
            bail!("aggregation.rotation_check_interval must be positive");
        }

        if self.storage.backend == StorageBackendKind::Fs && self.storage.root_dir.is_none() {
            bail!("storage.root_dir is required when storage.backend is fs");
        }

        if self.storage.retry_attempts == 0 {
            bail!("storage.retry_attempts must be at least 1");
        }

        if self.storage.prefix.starts_with('/') || self.storage.prefix.ends_with('/') {
            bail!("storage.prefix must not start or end with '/'");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.ingest.max_message_size, 1024 * 1024);
        assert_eq!(cfg.ingest.read_buffer_size, 64 * 1024);
        assert_eq!(cfg.aggregation.window_duration, Duration::from_secs(1800));
        assert_eq!(cfg.storage.backend, StorageBackendKind::Memory);
        assert_eq!(cfg.storage.prefix, "profiles");
        assert_eq!(cfg.storage.retry_attempts, 4);
        assert_eq!(cfg.storage.retry_backoff, Duration::from_millis(200));
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let cfg = Config::from_yaml(
            r#"
log_level: debug
ingest:
  listen_addr: "127.0.0.1:7171"
  max_message_size: 4096
aggregation:
  window_duration: 5m
  rotation_check_interval: 2s
storage:
  backend: fs
  root_dir: /var/lib/profagg
  prefix: prod/profiles
  retry_attempts: 2
  retry_backoff: 1s
"#,
        )
        .unwrap();

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.ingest.listen_addr, "127.0.0.1:7171");
        assert_eq!(cfg.ingest.max_message_size, 4096);
        assert_eq!(cfg.ingest.read_buffer_size, 64 * 1024);
        assert_eq!(cfg.aggregation.window_duration, Duration::from_secs(300));
        assert_eq!(
            cfg.aggregation.rotation_check_interval,
            Duration::from_secs(2)
        );
        assert_eq!(cfg.storage.backend, StorageBackendKind::Fs);
        assert_eq!(
            cfg.storage.root_dir.as_deref(),
            Some(Path::new("/var/lib/profagg"))
        );
        assert_eq!(cfg.storage.prefix, "prod/profiles");
        assert_eq!(cfg.storage.retry_attempts, 2);
        assert_eq!(cfg.storage.retry_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_log_level_flag_overrides_config() {
        let cfg = Config::from_yaml("log_level: warn\n").unwrap();
        assert_eq!(cfg.effective_log_level(None), "warn");
        assert_eq!(cfg.effective_log_level(Some("debug")), "debug");
        assert_eq!(Config::default().effective_log_level(None), "info");
    }

    #[test]
    fn test_fs_backend_requires_root_dir() {
        let err = Config::from_yaml("storage:\n  backend: fs\n").unwrap_err();
        assert!(err.to_string().contains("storage.root_dir"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.ingest.max_message_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.aggregation.window_duration = Duration::from_millis(1500);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.aggregation.rotation_check_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.storage.prefix = "/abs".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.storage.retry_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::from_yaml("storage:\n  backend: s3\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "health:\n  addr: \":9191\"\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.health.addr, ":9191");

        let missing = Config::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(missing.to_string().contains("reading config file"));
    }
}
