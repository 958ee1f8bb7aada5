//! HeddleConfig - `~/.heddle/heddle.toml`
//!
//! すべてのセクションは省略可能で、省略時はデフォルト値になる。
//! `HEDDLE_DB` 環境変数は `[storage] path` より優先する。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::services::DEFAULT_TIMEOUT;
use crate::locks::{DEFAULT_TTL, MAX_TTL};
use crate::scheduler::{DEFAULT_PRIORITY, RetryPolicy};

pub const DB_ENV: &str = "HEDDLE_DB";

/// Upper bound for `locks.max_ttl_secs` (30 days).
pub const TTL_CEILING_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    NoHomeDir,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeddleConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub locks: LockConfig,
    pub publisher: PublisherConfig,
    /// Per-service settings, keyed by service (task type) name.
    pub services: BTreeMap<String, ServiceConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file. In-memory when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_priority: i32,
    pub max_retries: u32,
    pub allow_forward_declarations: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: DEFAULT_PRIORITY,
            max_retries: RetryPolicy::default().max_retries,
            allow_forward_declarations: false,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL.as_secs(),
            max_ttl_secs: MAX_TTL.as_secs(),
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub flush_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 250,
            batch_size: 100,
        }
    }
}

impl PublisherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

impl HeddleConfig {
    pub fn heddle_dir() -> Result<PathBuf, ConfigError> {
        Ok(dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(".heddle"))
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::heddle_dir()?.join("heddle.toml"))
    }

    /// Reads `path`, or the default location when `None`. A missing file at
    /// the default location yields the defaults; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };
        debug!(path = %path.display(), "loading config");

        let mut config = if !explicit && !path.exists() {
            debug!("config file not found, using defaults");
            Self::default()
        } else {
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_toml_str(&text)?
        };
        config.apply_env(std::env::var_os(DB_ENV).map(PathBuf::from));
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// `HEDDLE_DB` wins over the file.
    pub fn apply_env(&mut self, db: Option<PathBuf>) {
        if let Some(db) = db.filter(|p| !p.as_os_str().is_empty()) {
            self.storage.path = Some(expand_tilde(&db));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.locks.default_ttl_secs == 0 || self.locks.max_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lock ttls must be positive".into()));
        }
        if self.locks.max_ttl_secs > TTL_CEILING_SECS {
            return Err(ConfigError::Invalid(format!(
                "locks.max_ttl_secs ({}) exceeds {TTL_CEILING_SECS}",
                self.locks.max_ttl_secs
            )));
        }
        if self.locks.default_ttl_secs > self.locks.max_ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "locks.default_ttl_secs ({}) exceeds locks.max_ttl_secs ({})",
                self.locks.default_ttl_secs, self.locks.max_ttl_secs
            )));
        }
        if self.publisher.batch_size == 0 {
            return Err(ConfigError::Invalid("publisher.batch_size must be positive".into()));
        }
        if let Some((name, _)) = self.services.iter().find(|(_, s)| s.timeout_ms == 0) {
            return Err(ConfigError::Invalid(format!("services.{name}.timeout_ms must be positive")));
        }
        Ok(())
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage.path.as_deref().map(expand_tilde)
    }

    /// Timeout for `service`, falling back to the default.
    pub fn service_timeout(&self, service: &str) -> Duration {
        self.services
            .get(service)
            .map(ServiceConfig::timeout)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
