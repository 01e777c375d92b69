use super::{thread_pool, PhaseProgress};
use crate::error::Error;
use crate::hasher::ChecksumCache;
use crate::progress::{Phase, ProgressReporter};
use crate::scanner;
use crate::storage::models::{
    CompareSide, DifferentPair, FileRecord, FileRole, IdenticalPair, MissingFile,
};
use crate::storage::Database;
use crate::volume::normalize;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CompareOptions {
    pub left_roots: Vec<PathBuf>,
    pub right_roots: Vec<PathBuf>,
    pub ignore_patterns: Vec<String>,
    pub threads: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompareSummary {
    pub left_files: usize,
    pub right_files: usize,
    /// Right-side files whose content the left side lacks.
    pub left_missing: usize,
    /// Left-side files whose content the right side lacks.
    pub right_missing: usize,
    pub identical: usize,
    pub different: usize,
    pub errors: usize,
}

impl CompareSummary {
    pub fn is_identical(&self) -> bool {
        self.left_missing == 0 && self.right_missing == 0 && self.different == 0
    }
}

/// Scan both pools, checksum them and record how their contents differ.
/// Earlier comparison results are replaced.
pub fn run_compare(
    db: &Database,
    cache: &ChecksumCache<'_>,
    options: &CompareOptions,
    reporter: &dyn ProgressReporter,
) -> Result<CompareSummary, Error> {
    let volumes = cache.volumes();
    for (role, roots) in [
        (FileRole::LeftPool, &options.left_roots),
        (FileRole::RightPool, &options.right_roots),
    ] {
        scanner::scan_roots(db, volumes, role, roots, &options.ignore_patterns, reporter)?;
    }

    let mut summary = CompareSummary::default();
    let mut side = |role, roots: &[PathBuf]| {
        checksummed(db, cache, role, roots, options.threads, reporter, &mut summary.errors)
    };
    let left = side(FileRole::LeftPool, &options.left_roots)?;
    let right = side(FileRole::RightPool, &options.right_roots)?;
    summary.left_files = left.len();
    summary.right_files = right.len();

    db.clear_compare_results()?;

    let left_missing = missing_from(&right, &left);
    let right_missing = missing_from(&left, &right);
    summary.left_missing = db.insert_missing_files(CompareSide::Left, &left_missing)?;
    summary.right_missing = db.insert_missing_files(CompareSide::Right, &right_missing)?;

    let mut first_right: HashMap<&str, &FileRecord> = HashMap::new();
    for (record, checksum) in &right {
        first_right.entry(checksum.as_str()).or_insert(record);
    }
    let identical: Vec<IdenticalPair> = left
        .iter()
        .filter_map(|(record, checksum)| {
            first_right.get(checksum.as_str()).map(|other| IdenticalPair {
                left: record.identity.clone(),
                right: other.identity.clone(),
                checksum: checksum.clone(),
            })
        })
        .collect();
    summary.identical = db.insert_identical_pairs(&identical)?;

    let right_by_path: HashMap<&str, &(FileRecord, String)> = right
        .iter()
        .filter_map(|entry| entry.0.root_relative_path.as_deref().map(|p| (p, entry)))
        .collect();
    let different: Vec<DifferentPair> = left
        .iter()
        .filter_map(|(record, checksum)| {
            let path = record.root_relative_path.as_deref()?;
            let (other, other_checksum) = right_by_path.get(path)?;
            (other_checksum != checksum).then(|| DifferentPair {
                pool_relative_path: path.to_string(),
                left: record.identity.clone(),
                left_checksum: checksum.clone(),
                right: other.identity.clone(),
                right_checksum: other_checksum.clone(),
            })
        })
        .collect();
    summary.different = db.insert_different_pairs(&different)?;

    info!(
        "Compared {} left and {} right files: {} missing on the left, {} missing on the right, {} identical, {} different",
        summary.left_files,
        summary.right_files,
        summary.left_missing,
        summary.right_missing,
        summary.identical,
        summary.different
    );
    Ok(summary)
}

/// Files of `from` whose content never occurs in `other`.
fn missing_from(from: &[(FileRecord, String)], other: &[(FileRecord, String)]) -> Vec<MissingFile> {
    let present: HashSet<&str> = other.iter().map(|(_, c)| c.as_str()).collect();
    from.iter()
        .filter(|(_, checksum)| !present.contains(checksum.as_str()))
        .map(|(record, checksum)| MissingFile {
            identity: record.identity.clone(),
            size: record.size,
            last_modified: record.last_modified,
            checksum: checksum.clone(),
        })
        .collect()
}

/// Catalogued files of `role` below `roots` that still exist, with their
/// current checksum, in scan order.
fn checksummed(
    db: &Database,
    cache: &ChecksumCache<'_>,
    role: FileRole,
    roots: &[PathBuf],
    threads: usize,
    reporter: &dyn ProgressReporter,
    errors: &mut usize,
) -> Result<Vec<(FileRecord, String)>, Error> {
    let roots = roots
        .iter()
        .map(|r| normalize(r))
        .collect::<Result<Vec<_>, _>>()?;
    let records = db.list_file_records(role)?;

    let progress = PhaseProgress::start(reporter, Phase::Compare, records.len());
    let pool = thread_pool(threads)?;
    let results: Vec<Lookup> = pool.install(|| {
        records
            .par_iter()
            .map(|record| {
                let result = lookup(cache, &roots, record);
                progress.tick();
                result
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    progress.finish();

    let mut files = Vec::new();
    for (record, result) in records.into_iter().zip(results) {
        match result {
            Lookup::Found(checksum) => files.push((record, checksum)),
            Lookup::Skipped => {}
            Lookup::Failed => *errors += 1,
        }
    }
    Ok(files)
}

enum Lookup {
    Found(String),
    Skipped,
    Failed,
}

fn lookup(cache: &ChecksumCache<'_>, roots: &[PathBuf], record: &FileRecord) -> Result<Lookup, Error> {
    let Some(path) = cache.volumes().reconstruct(&record.identity) else {
        warn!("Volume {} not available; skipping {}", record.identity.uid, record.identity);
        return Ok(Lookup::Skipped);
    };
    // Catalog rows left over from scans of other roots.
    if !roots.iter().any(|root| path.starts_with(root)) {
        return Ok(Lookup::Skipped);
    }
    match cache.get_or_compute_with_invalidation(&path) {
        Ok(Some(checksum)) => Ok(Lookup::Found(checksum)),
        Ok(None) => Ok(Lookup::Skipped),
        Err(e) => {
            let e = e.into_file_error()?;
            error!("Failed to checksum {}: {}", path.display(), e);
            Ok(Lookup::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::FileIdentity;

    fn entry(path: &str, checksum: &str) -> (FileRecord, String) {
        let record = FileRecord {
            identity: FileIdentity::new("vol", path),
            size: 1,
            last_modified: 0,
            root_relative_path: Some(path.to_string()),
        };
        (record, checksum.to_string())
    }

    #[test]
    fn test_missing_from_matches_by_content_not_path() {
        let left = vec![entry("a.txt", "x"), entry("b.txt", "y")];
        let right = vec![entry("renamed.txt", "x")];
        let missing = missing_from(&left, &right);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].identity.relative_path, "b.txt");
        assert!(missing_from(&right, &left).is_empty());
    }
}
