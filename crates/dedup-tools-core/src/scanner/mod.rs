mod walk;

pub use walk::{compile_patterns, walk_root, WalkStats};

use crate::config::non_overlapping_directories;
use crate::error::Error;
use crate::progress::{Phase, ProgressReporter};
use crate::storage::models::FileRole;
use crate::storage::Database;
use crate::volume::{normalize, VolumeIdentity};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// Outcome of cataloguing one or more roots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub files: usize,
    pub bytes: u64,
    pub untracked: usize,
    pub unreadable: usize,
    /// Source files that were new or changed and now wait for copying.
    pub queued: usize,
}

/// Walk `roots` and upsert what was found into the catalog table of `role`.
/// Scanning sources also queues new or changed files for the copy phase.
pub fn scan_roots(
    db: &Database,
    volumes: &VolumeIdentity,
    role: FileRole,
    roots: &[PathBuf],
    ignore_globs: &[String],
    reporter: &dyn ProgressReporter,
) -> Result<ScanSummary, Error> {
    let roots = roots
        .iter()
        .map(|r| normalize(r))
        .collect::<Result<Vec<_>, _>>()?;
    let roots = non_overlapping_directories(roots);
    let patterns = compile_patterns(ignore_globs);
    info!("Scanning {} roots into {} catalog: {:?}", roots.len(), role, roots);

    let started = Instant::now();
    reporter.on_phase_start(Phase::Scan, None);
    let mut summary = ScanSummary::default();
    let mut seen = 0u64;

    for root in &roots {
        let (records, stats) = walk_root(root, volumes, &patterns, |_| {
            seen += 1;
            reporter.on_phase_progress(Phase::Scan, seen);
        })?;
        if role == FileRole::Source {
            summary.queued += db.register_sources(&records)?;
        } else {
            db.upsert_file_records(role, &records)?;
        }
        summary.files += stats.files;
        summary.bytes += stats.bytes;
        summary.untracked += stats.untracked;
        summary.unreadable += stats.unreadable;
    }

    let elapsed = started.elapsed().as_secs_f64();
    reporter.on_phase_complete(Phase::Scan, elapsed);
    info!(
        "Catalogued {} {} files ({} bytes) in {:.2}s",
        summary.files, role, summary.bytes, elapsed
    );
    Ok(summary)
}
