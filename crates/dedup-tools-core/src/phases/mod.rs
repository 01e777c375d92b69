//! Resumable per-tool pipelines over the catalog, cache and status tables.

pub mod checksum;
pub mod compare;
pub mod copy;
pub mod dupes_move;
pub mod summary;
pub mod verify;

use crate::error::Error;
use crate::progress::{Phase, ProgressReporter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub(crate) fn thread_pool(threads: usize) -> Result<rayon::ThreadPool, Error> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| Error::Other(format!("failed to build worker pool: {}", e)))
}

/// `root` joined with a `/`-separated relative path.
pub(crate) fn join_relative(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// Candidate name number `attempt` for `relative`: the path itself, then
/// the file name prefixed with the checksum (`<checksum8>_<name>`), then
/// with a counter as well (`<checksum8>_<attempt>_<name>`).
pub(crate) fn disambiguate(relative: &str, checksum: &str, attempt: usize) -> String {
    if attempt == 0 {
        return relative.to_string();
    }
    let (parent, name) = match relative.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, relative),
    };
    let prefix = &checksum[..checksum.len().min(8)];
    let name = if attempt == 1 {
        format!("{}_{}", prefix, name)
    } else {
        format!("{}_{}_{}", prefix, attempt, name)
    };
    match parent {
        Some(parent) => format!("{}/{}", parent, name),
        None => name,
    }
}

/// Shared completion counter feeding a [`ProgressReporter`] from workers.
pub(crate) struct PhaseProgress<'a> {
    reporter: &'a dyn ProgressReporter,
    phase: Phase,
    completed: AtomicU64,
    started: Instant,
}

impl<'a> PhaseProgress<'a> {
    pub(crate) fn start(reporter: &'a dyn ProgressReporter, phase: Phase, total: usize) -> Self {
        reporter.on_phase_start(phase, Some(total as u64));
        Self {
            reporter,
            phase,
            completed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn tick(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        self.reporter.on_phase_progress(self.phase, done);
    }

    pub(crate) fn finish(self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.reporter.on_phase_complete(self.phase, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative_uses_native_separators() {
        let joined = join_relative(Path::new("/dst"), "a/b/c.txt");
        assert_eq!(joined, Path::new("/dst").join("a").join("b").join("c.txt"));
    }

    #[test]
    fn test_disambiguate_keeps_directory() {
        let checksum = "0123456789abcdef";
        assert_eq!(disambiguate("a/b.txt", checksum, 0), "a/b.txt");
        assert_eq!(disambiguate("a/b.txt", checksum, 1), "a/01234567_b.txt");
        assert_eq!(disambiguate("b.txt", checksum, 3), "01234567_3_b.txt");
    }
}
