use crate::config::{AppConfig, ConnectionMode};
use crate::error::Error;
use crate::storage::Database;
use crate::volume::VolumeIdentity;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_CACHE_FILE: &str = "checksum-cache.db";

/// File layout of one job: `<job_dir>/<job_name>.db`, the checksum cache
/// (shared by default between jobs living in the same directory) and the
/// log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub job_dir: PathBuf,
    pub job_name: String,
    pub database: PathBuf,
    pub checksum_db: PathBuf,
    pub log_file: PathBuf,
}

impl JobPaths {
    pub fn new(job_dir: &Path, job_name: &str, checksum_db: Option<&Path>) -> Self {
        Self {
            job_dir: job_dir.to_path_buf(),
            job_name: job_name.to_string(),
            database: job_dir.join(format!("{}.db", job_name)),
            checksum_db: checksum_db
                .map(Path::to_path_buf)
                .unwrap_or_else(|| job_dir.join(DEFAULT_CACHE_FILE)),
            log_file: job_dir.join("logs").join(format!("{}.log", job_name)),
        }
    }

    pub fn from_config(job_dir: &Path, job_name: &str, config: &AppConfig) -> Self {
        Self::new(job_dir, job_name, config.checksum_db.as_deref())
    }

    pub fn is_initialized(&self) -> bool {
        self.database.is_file()
    }

    /// Create the job directory and both stores. Idempotent.
    pub fn init(&self, config: &AppConfig) -> Result<Database, Error> {
        fs::create_dir_all(&self.job_dir)?;
        if let Some(parent) = self.checksum_db.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = self.open_database(config)?;
        info!("Job '{}' initialized in {}", self.job_name, self.job_dir.display());
        Ok(db)
    }

    /// Open an initialized job.
    pub fn open(&self, config: &AppConfig) -> Result<Database, Error> {
        if !self.is_initialized() {
            return Err(Error::InvalidArgument(format!(
                "job '{}' has not been initialized in {}",
                self.job_name,
                self.job_dir.display()
            )));
        }
        self.open_database(config)
    }

    fn open_database(&self, config: &AppConfig) -> Result<Database, Error> {
        let db = match config.connection_mode {
            ConnectionMode::Shared => Database::open(&self.database, &self.checksum_db)?,
            ConnectionMode::PerCall => Database::open_per_call(&self.database, &self.checksum_db)?,
        };
        debug!(
            "Opened {} ({:?} connections, cache {})",
            self.database.display(),
            config.connection_mode,
            self.checksum_db.display()
        );
        Ok(db.with_retry_policy(config.retry_policy()))
    }
}

/// System mount table plus the configured pseudo-volumes.
pub fn build_volumes(config: &AppConfig) -> Result<VolumeIdentity, Error> {
    let mut volumes = VolumeIdentity::system();
    for dir in &config.pseudo_volumes {
        volumes.add_pseudo_volume(dir)?;
    }
    Ok(volumes)
}
