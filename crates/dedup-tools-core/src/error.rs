use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("{path} does not contain a `{table}` table")]
    MissingTable { path: PathBuf, table: &'static str },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a failed per-file operation.
///
/// `NotFound` and `Unavailable` are expected conditions (a file vanished, a
/// volume is not attached); the others are failures that end up recorded as
/// `error` row state.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("volume {uid} is not available (needed for {relative_path})")]
    Unavailable { uid: String, relative_path: String },

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("integrity failure: {0}")]
    Integrity(String),
}

impl FileError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            FileError::NotFound(path)
        } else {
            FileError::Io { path, source }
        }
    }

    pub fn is_expected(&self) -> bool {
        matches!(self, FileError::NotFound(_) | FileError::Unavailable { .. })
    }
}

impl Error {
    /// Split a per-file failure from a structural one. Structural errors stay
    /// in `Err` so `?` keeps aborting the run.
    pub fn into_file_error(self) -> Result<FileError, Error> {
        match self {
            Error::File(e) => Ok(e),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_io_error_maps_to_expected_variant() {
        let err = FileError::io("/x", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, FileError::NotFound(_)));
        assert!(err.is_expected());

        let err = FileError::io("/x", io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(!err.is_expected());
    }
}
