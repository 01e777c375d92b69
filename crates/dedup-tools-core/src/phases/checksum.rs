use super::{thread_pool, PhaseProgress};
use crate::error::Error;
use crate::hasher::ChecksumCache;
use crate::progress::{Phase, ProgressReporter};
use crate::scanner::{self, ScanSummary};
use crate::storage::models::{FileRecord, FileRole};
use crate::storage::Database;
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumSummary {
    pub checksummed: usize,
    pub missing: usize,
    pub unavailable: usize,
    pub errors: usize,
    /// Files actually read; the rest were cache hits.
    pub hashed: u64,
}

enum Outcome {
    Checksummed,
    Missing,
    Unavailable,
    Failed,
}

fn checksum_one(cache: &ChecksumCache<'_>, record: &FileRecord) -> Result<Outcome, Error> {
    let Some(path) = cache.volumes().reconstruct(&record.identity) else {
        warn!("Volume {} not available; skipping {}", record.identity.uid, record.identity);
        return Ok(Outcome::Unavailable);
    };
    match cache.get_or_compute_with_invalidation(&path) {
        Ok(Some(_)) => Ok(Outcome::Checksummed),
        Ok(None) => {
            warn!("{} no longer exists", path.display());
            Ok(Outcome::Missing)
        }
        Err(e) => {
            let e = e.into_file_error()?;
            error!("Failed to checksum {}: {}", path.display(), e);
            Ok(Outcome::Failed)
        }
    }
}

/// Make sure every catalogued file of `role` has a current cache entry.
pub fn ensure_checksums(
    db: &Database,
    cache: &ChecksumCache<'_>,
    role: FileRole,
    threads: usize,
    reporter: &dyn ProgressReporter,
) -> Result<ChecksumSummary, Error> {
    let records = db.list_file_records(role)?;
    info!("Checksumming {} {} files with {} threads", records.len(), role, threads);

    let hashed_before = cache.hashes_computed();
    let progress = PhaseProgress::start(reporter, Phase::Checksum, records.len());
    let pool = thread_pool(threads)?;
    let outcomes: Vec<Outcome> = pool.install(|| {
        records
            .par_iter()
            .map(|record| {
                let outcome = checksum_one(cache, record);
                progress.tick();
                outcome
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    let elapsed = progress.finish();

    let mut summary = ChecksumSummary::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Checksummed => summary.checksummed += 1,
            Outcome::Missing => summary.missing += 1,
            Outcome::Unavailable => summary.unavailable += 1,
            Outcome::Failed => summary.errors += 1,
        }
    }
    summary.hashed = cache.hashes_computed() - hashed_before;
    info!(
        "Checksum phase for {} done in {:.2}s: {} ok ({} hashed), {} missing, {} unavailable, {} errors",
        role,
        elapsed,
        summary.checksummed,
        summary.hashed,
        summary.missing,
        summary.unavailable,
        summary.errors
    );
    Ok(summary)
}

/// Catalog `roots` under `role` and bring their checksums up to date, so
/// pool-wide lookups can find their content.
pub fn index_pool(
    db: &Database,
    cache: &ChecksumCache<'_>,
    role: FileRole,
    roots: &[PathBuf],
    ignore_globs: &[String],
    threads: usize,
    reporter: &dyn ProgressReporter,
) -> Result<(ScanSummary, ChecksumSummary), Error> {
    let scanned = scanner::scan_roots(db, cache.volumes(), role, roots, ignore_globs, reporter)?;
    let checksummed = ensure_checksums(db, cache, role, threads, reporter)?;
    Ok((scanned, checksummed))
}
