use crate::storage::RetryPolicy;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How worker threads reach the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// One connection behind a mutex.
    #[default]
    Shared,
    /// A fresh connection per operation.
    PerCall,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub threads: usize,
    pub ignore_patterns: Vec<String>,
    /// Directories tracked as volumes of their own, uid = absolute path.
    pub pseudo_volumes: Vec<PathBuf>,
    pub slow_hash_warning_secs: u64,
    pub db_retries: u32,
    pub db_retry_backoff_ms: u64,
    pub connection_mode: ConnectionMode,
    /// Checksum cache location; defaults to `checksum-cache.db` in the job dir.
    pub checksum_db: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ignore_patterns: Vec::new(),
            pseudo_volumes: Vec::new(),
            slow_hash_warning_secs: 30,
            db_retries: 8,
            db_retry_backoff_ms: 50,
            connection_mode: ConnectionMode::Shared,
            checksum_db: None,
        }
    }
}

impl AppConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.db_retries,
            backoff: Duration::from_millis(self.db_retry_backoff_ms),
        }
    }

    pub fn slow_hash_warning(&self) -> Duration {
        Duration::from_secs(self.slow_hash_warning_secs)
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.max(1)
    }
}

/// Defaults, then the config file (explicit path, or an optional
/// `dedup-tools.*` in the working directory), then `DEDUP_*` environment
/// variables.
pub fn load_configuration(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file = match path {
        Some(path) => ConfigFile::from(path).required(true),
        None => ConfigFile::with_name("dedup-tools").required(false),
    };
    let builder = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("DEDUP")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ignore_patterns")
                .with_list_parse_key("pseudo_volumes"),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Drop directories nested inside another directory of the list, so no file
/// is walked twice. Order of the surviving entries is preserved.
pub fn non_overlapping_directories(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for dir in dirs {
        if result.iter().any(|kept| dir.starts_with(kept)) {
            continue;
        }
        result.retain(|kept| !kept.starts_with(&dir));
        result.push(dir);
    }

    result
}
