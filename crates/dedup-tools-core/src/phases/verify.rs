use super::{thread_pool, PhaseProgress};
use crate::error::Error;
use crate::hasher::ChecksumCache;
use crate::progress::{Phase, ProgressReporter};
use crate::storage::models::{
    fingerprint, CopyStatus, CopyStatusRow, DeepResult, FileRole, ShallowResult, VerifyStage,
    VerifyStatus,
};
use crate::storage::Database;
use rayon::prelude::*;
use std::fs;
use std::io;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub stage: VerifyStage,
    /// Drop earlier results of this stage before verifying.
    pub reverify: bool,
    pub threads: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifySummary {
    pub ok: usize,
    /// Results other than `ok`; each flips its copy row to `error`.
    pub failed: usize,
    /// Files whose source or destination volume is not mounted.
    pub skipped: usize,
}

/// Check every `done` copy against the destination, recording one result
/// row per file. Files that fail go back to `error` so the next copy run
/// retries them.
pub fn run_verify(
    db: &Database,
    cache: &ChecksumCache<'_>,
    options: &VerifyOptions,
    reporter: &dyn ProgressReporter,
) -> Result<VerifySummary, Error> {
    if options.reverify {
        let cleared = db.clear_verification(options.stage)?;
        info!("Cleared {} previous {:?} verification results", cleared, options.stage);
    }

    let done = db.list_copy_status(Some(CopyStatus::Done))?;
    info!("{:?} verification of {} copied files", options.stage, done.len());

    let progress = PhaseProgress::start(reporter, Phase::Verify, done.len());
    let pool = thread_pool(options.threads)?;
    let statuses: Vec<Option<VerifyStatus>> = pool.install(|| {
        done.par_iter()
            .map(|row| {
                let status = match options.stage {
                    VerifyStage::Shallow => verify_shallow(db, cache, row),
                    VerifyStage::Deep => verify_deep(db, cache, row),
                };
                progress.tick();
                status
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    let elapsed = progress.finish();

    let mut summary = VerifySummary::default();
    for status in statuses {
        match status {
            Some(VerifyStatus::Ok) => summary.ok += 1,
            Some(_) => summary.failed += 1,
            None => summary.skipped += 1,
        }
    }
    info!(
        "{:?} verification done in {:.2}s: {} ok, {} failed, {} skipped",
        options.stage, elapsed, summary.ok, summary.failed, summary.skipped
    );
    Ok(summary)
}

/// Size and mtime the destination file is expected to have.
fn expected_fingerprint(
    db: &Database,
    row: &CopyStatusRow,
) -> Result<Option<(i64, i64)>, Error> {
    if let Some(dest) = &row.dest {
        for role in [FileRole::Destination, FileRole::DestinationPool] {
            if let Some(record) = db.get_file_record(role, dest)? {
                return Ok(Some((record.size, record.last_modified)));
            }
        }
    }
    Ok(db
        .get_file_record(FileRole::Source, &row.identity)?
        .map(|r| (r.size, r.last_modified)))
}

fn verify_shallow(
    db: &Database,
    cache: &ChecksumCache<'_>,
    row: &CopyStatusRow,
) -> Result<Option<VerifyStatus>, Error> {
    let expected = expected_fingerprint(db, row)?;
    let mut result = ShallowResult {
        identity: row.identity.clone(),
        exists: false,
        size_matched: false,
        last_modified_matched: false,
        expected_size: expected.map(|e| e.0),
        actual_size: None,
        expected_last_modified: expected.map(|e| e.1),
        actual_last_modified: None,
        status: VerifyStatus::Missing,
        error: None,
    };

    let Some(dest) = &row.dest else {
        result.error = Some("no destination recorded".to_string());
        return record_shallow(db, result).map(Some);
    };
    let path = match cache.volumes().locate(dest) {
        Ok(path) => path,
        Err(e) => {
            warn!("Cannot verify {}: {}", row.identity, e);
            return Ok(None);
        }
    };

    match fs::metadata(&path) {
        Ok(metadata) => {
            let (size, last_modified) = fingerprint(&metadata);
            result.exists = true;
            result.actual_size = Some(size);
            result.actual_last_modified = Some(last_modified);
            result.size_matched = result.expected_size == Some(size);
            result.last_modified_matched = result.expected_last_modified == Some(last_modified);
            if result.size_matched && result.last_modified_matched {
                result.status = VerifyStatus::Ok;
            } else {
                result.status = VerifyStatus::Mismatch;
                result.error = Some(format!(
                    "expected size {:?} mtime {:?}, found size {} mtime {}",
                    result.expected_size, result.expected_last_modified, size, last_modified
                ));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            result.error = Some(format!("{} does not exist", path.display()));
        }
        Err(e) => {
            result.error = Some(format!("cannot stat {}: {}", path.display(), e));
        }
    }
    record_shallow(db, result).map(Some)
}

fn record_shallow(db: &Database, result: ShallowResult) -> Result<VerifyStatus, Error> {
    db.record_shallow_result(&result)?;
    if result.status != VerifyStatus::Ok {
        warn!("Shallow verification of {} failed: {:?}", result.identity, result.error);
        let message = format!(
            "shallow verification {}: {}",
            result.status,
            result.error.as_deref().unwrap_or("")
        );
        db.set_copy_status(&result.identity, CopyStatus::Error, None, None, Some(&message))?;
    }
    Ok(result.status)
}

fn verify_deep(
    db: &Database,
    cache: &ChecksumCache<'_>,
    row: &CopyStatusRow,
) -> Result<Option<VerifyStatus>, Error> {
    let volumes = cache.volumes();
    let mut result = DeepResult {
        identity: row.identity.clone(),
        checksum_matched: false,
        expected_checksum: row.checksum.clone(),
        src_checksum: None,
        dst_checksum: None,
        status: VerifyStatus::Error,
        error: None,
    };

    let Some(dest) = &row.dest else {
        result.error = Some("no destination recorded".to_string());
        return record_deep(db, result).map(Some);
    };
    let located = volumes
        .locate(&row.identity)
        .and_then(|src| volumes.locate(dest).map(|dst| (src, dst)));
    let (src_path, dst_path) = match located {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Cannot verify {}: {}", row.identity, e);
            return Ok(None);
        }
    };

    let src_checksum = recompute(cache, &src_path)?;
    let dst_checksum = recompute(cache, &dst_path)?;
    result.src_checksum = src_checksum.clone().ok();
    result.dst_checksum = dst_checksum.clone().ok();

    match (src_checksum, dst_checksum, &row.checksum) {
        (Err(e), _, _) => result.error = Some(format!("source: {}", e)),
        (_, Err(e), _) => result.error = Some(format!("destination: {}", e)),
        (_, _, None) => result.error = Some("no checksum recorded at copy time".to_string()),
        (Ok(src), Ok(dst), Some(expected)) => {
            result.checksum_matched = &src == expected && &dst == expected;
            if result.checksum_matched {
                result.status = VerifyStatus::Ok;
            } else {
                result.status = VerifyStatus::Failed;
                result.error = Some(format!(
                    "checksum mismatch: expected {}, source {}, destination {}",
                    expected, src, dst
                ));
            }
        }
    }
    record_deep(db, result).map(Some)
}

/// Fresh checksum of `path`; `Err` carries a per-file failure description.
fn recompute(cache: &ChecksumCache<'_>, path: &std::path::Path) -> Result<Result<String, String>, Error> {
    match cache.recompute(path) {
        Ok(Some(checksum)) => Ok(Ok(checksum)),
        Ok(None) => Ok(Err(format!("{} does not exist", path.display()))),
        Err(e) => Ok(Err(e.into_file_error()?.to_string())),
    }
}

fn record_deep(db: &Database, result: DeepResult) -> Result<VerifyStatus, Error> {
    db.record_deep_result(&result)?;
    if result.status != VerifyStatus::Ok {
        warn!("Deep verification of {} failed: {:?}", result.identity, result.error);
        let message = format!(
            "deep verification {}: {}",
            result.status,
            result.error.as_deref().unwrap_or("")
        );
        db.set_copy_status(&result.identity, CopyStatus::Error, None, None, Some(&message))?;
    }
    Ok(result.status)
}
