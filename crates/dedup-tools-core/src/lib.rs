pub mod config;
pub mod error;
pub mod hasher;
pub mod job;
pub mod phases;
pub mod progress;
pub mod scanner;
pub mod storage;
pub mod transfer;
pub mod volume;

pub use config::AppConfig;
pub use error::{Error, FileError};
pub use hasher::ChecksumCache;
pub use job::JobPaths;
pub use progress::{Phase, ProgressReporter, SilentReporter};
pub use storage::Database;
pub use volume::{FileIdentity, VolumeIdentity};
