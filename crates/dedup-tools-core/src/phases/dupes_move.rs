//! Consolidation of a duplicate pool: plan one keeper per content group,
//! move every other copy into a removal folder, then verify the moves.

use super::{disambiguate, join_relative, thread_pool, PhaseProgress};
use crate::error::{Error, FileError};
use crate::hasher::ChecksumCache;
use crate::progress::{Phase, ProgressReporter};
use crate::storage::models::{fingerprint, FileRecord, FileRole, MovePlanEntry, MoveStatus};
use crate::storage::Database;
use crate::transfer::{transfer_file, TransferMode};
use crate::volume::{normalize, FileIdentity};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Where a duplicate lands inside the removal folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Keep the path below the pool root.
    #[default]
    Preserve,
    /// File name only.
    Flatten,
}

#[derive(Debug, Clone)]
pub struct MoveOptions {
    pub dupes_dir: PathBuf,
    pub layout: Layout,
    pub threads: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzeSummary {
    pub files: usize,
    pub groups: usize,
    pub keepers: usize,
    pub planned: usize,
    pub unavailable: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MoveSummary {
    pub moved: usize,
    pub errors: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MoveVerifySummary {
    pub verified: usize,
    pub keepers: usize,
    pub errors: usize,
    pub skipped: usize,
}

enum Step {
    Done,
    Skipped,
    Failed,
}

/// Group the catalogued dedup pool by content and write a move plan.
///
/// Rows still `planned` from an earlier analysis are replaced; keeper, moved,
/// verified and error rows are kept, and an existing keeper stays the keeper
/// of its group.
pub fn analyze(
    db: &Database,
    cache: &ChecksumCache<'_>,
    options: &MoveOptions,
    reporter: &dyn ProgressReporter,
) -> Result<AnalyzeSummary, Error> {
    let volumes = cache.volumes();
    fs::create_dir_all(&options.dupes_dir)?;
    let dupes_dir = normalize(&options.dupes_dir)?;
    if volumes.identity(&dupes_dir).is_none() {
        return Err(Error::InvalidArgument(format!(
            "dupes directory {} is not on a known volume",
            dupes_dir.display()
        )));
    }

    let dropped = db.delete_planned_moves()?;
    if dropped > 0 {
        info!("Dropped {} stale planned moves", dropped);
    }

    let records = db.list_file_records(FileRole::DedupPool)?;
    let mut summary = AnalyzeSummary {
        files: records.len(),
        ..AnalyzeSummary::default()
    };

    let groups: DashMap<String, Vec<usize>> = DashMap::new();
    let progress = PhaseProgress::start(reporter, Phase::Analyze, records.len());
    let pool = thread_pool(options.threads)?;
    let outcomes: Vec<Step> = pool.install(|| {
        records
            .par_iter()
            .enumerate()
            .map(|(index, record)| {
                let step = group_one(cache, &dupes_dir, &groups, index, record);
                progress.tick();
                step
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    progress.finish();

    for outcome in outcomes {
        match outcome {
            Step::Skipped => summary.unavailable += 1,
            Step::Failed => summary.errors += 1,
            Step::Done => {}
        }
    }

    let existing: HashMap<FileIdentity, MovePlanEntry> = db
        .list_move_plan(&[])?
        .into_iter()
        .map(|entry| (entry.identity.clone(), entry))
        .collect();
    let mut taken: HashSet<PathBuf> = existing
        .values()
        .filter_map(|e| e.move_to.as_ref().and_then(|m| volumes.reconstruct(m)))
        .collect();

    let mut groups: Vec<(String, Vec<usize>)> = groups
        .into_iter()
        .map(|(checksum, mut members)| {
            members.sort_unstable();
            (checksum, members)
        })
        .collect();
    groups.sort_by_key(|(_, members)| members[0]);

    let mut plan = Vec::new();
    for (checksum, members) in groups {
        let existing_keeper = db.get_keeper(&checksum)?.map(|k| k.identity);
        if members.len() < 2 && existing_keeper.is_none() {
            continue;
        }

        let keeper = match existing_keeper {
            Some(keeper) => keeper,
            None => {
                let Some(&first) = members.iter().find(|&&i| {
                    existing
                        .get(&records[i].identity)
                        .map_or(true, |entry| entry.is_keeper)
                }) else {
                    continue;
                };
                let keeper = records[first].identity.clone();
                plan.push(MovePlanEntry {
                    identity: keeper.clone(),
                    checksum: checksum.clone(),
                    move_to: None,
                    status: MoveStatus::Keeper,
                    error_message: None,
                    is_keeper: true,
                });
                summary.keepers += 1;
                keeper
            }
        };

        let mut planned_here = 0;
        for &index in &members {
            let record = &records[index];
            if record.identity == keeper || existing.contains_key(&record.identity) {
                continue;
            }
            let relative = match options.layout {
                Layout::Preserve => record
                    .root_relative_path
                    .clone()
                    .unwrap_or_else(|| record.identity.relative_path.clone()),
                Layout::Flatten => file_name(&record.identity.relative_path).to_string(),
            };
            let target = unique_target(&dupes_dir, &relative, &checksum, &taken);
            let Some(move_to) = volumes.identity(&target) else {
                return Err(Error::InvalidArgument(format!(
                    "target {} is not on a known volume",
                    target.display()
                )));
            };
            taken.insert(target);
            plan.push(MovePlanEntry {
                identity: record.identity.clone(),
                checksum: checksum.clone(),
                move_to: Some(move_to),
                status: MoveStatus::Planned,
                error_message: None,
                is_keeper: false,
            });
            planned_here += 1;
        }
        if planned_here > 0 {
            summary.groups += 1;
            summary.planned += planned_here;
        }
    }

    db.insert_move_plan(&plan)?;
    info!(
        "Analysis of {} pool files: {} duplicate groups, {} new keepers, {} moves planned",
        summary.files, summary.groups, summary.keepers, summary.planned
    );
    Ok(summary)
}

fn group_one(
    cache: &ChecksumCache<'_>,
    dupes_dir: &Path,
    groups: &DashMap<String, Vec<usize>>,
    index: usize,
    record: &FileRecord,
) -> Result<Step, Error> {
    let Some(path) = cache.volumes().reconstruct(&record.identity) else {
        warn!("Volume {} not available; skipping {}", record.identity.uid, record.identity);
        return Ok(Step::Skipped);
    };
    // Files already moved into the removal folder are not pool members.
    if path.starts_with(dupes_dir) {
        return Ok(Step::Done);
    }
    match cache.get_or_compute_with_invalidation(&path) {
        Ok(Some(checksum)) => {
            groups.entry(checksum).or_default().push(index);
            Ok(Step::Done)
        }
        Ok(None) => {
            debug!("{} no longer exists", path.display());
            Ok(Step::Done)
        }
        Err(e) => {
            let e = e.into_file_error()?;
            error!("Failed to checksum {}: {}", path.display(), e);
            Ok(Step::Failed)
        }
    }
}

/// Target path under `dupes_dir` that no other plan row uses and that does
/// not already exist. Collisions get the checksum prefix, then a counter.
fn unique_target(
    dupes_dir: &Path,
    relative: &str,
    checksum: &str,
    taken: &HashSet<PathBuf>,
) -> PathBuf {
    (0..)
        .map(|attempt| join_relative(dupes_dir, &disambiguate(relative, checksum, attempt)))
        .find(|path| !taken.contains(path) && !path.exists())
        .unwrap_or_else(|| dupes_dir.join(relative))
}

/// Move every `planned` (and previously failed) duplicate into the removal
/// folder. Each attempt leaves a history row.
pub fn execute_moves(
    db: &Database,
    cache: &ChecksumCache<'_>,
    threads: usize,
    reporter: &dyn ProgressReporter,
) -> Result<MoveSummary, Error> {
    let rows: Vec<MovePlanEntry> = db
        .list_move_plan(&[MoveStatus::Planned, MoveStatus::Error])?
        .into_iter()
        .filter(|row| !row.is_keeper)
        .collect();
    info!("{} duplicates to move", rows.len());

    let progress = PhaseProgress::start(reporter, Phase::Move, rows.len());
    let pool = thread_pool(threads)?;
    let outcomes: Vec<Step> = pool.install(|| {
        rows.par_iter()
            .map(|row| {
                let step = move_one(db, cache, row);
                progress.tick();
                step
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    let elapsed = progress.finish();

    let mut summary = MoveSummary::default();
    for outcome in outcomes {
        match outcome {
            Step::Done => summary.moved += 1,
            Step::Skipped => summary.skipped += 1,
            Step::Failed => summary.errors += 1,
        }
    }
    info!(
        "Move phase done in {:.2}s: {} moved, {} errors, {} skipped",
        elapsed, summary.moved, summary.errors, summary.skipped
    );
    Ok(summary)
}

fn move_one(db: &Database, cache: &ChecksumCache<'_>, row: &MovePlanEntry) -> Result<Step, Error> {
    let id = &row.identity;
    match try_move(db, cache, row) {
        Ok(Step::Done) => {
            db.update_move_status(id, MoveStatus::Moved, None)?;
            db.append_move_history(id, "move", "moved", None)?;
            Ok(Step::Done)
        }
        Ok(step) => Ok(step),
        Err(e) => {
            let e = e.into_file_error()?;
            if let FileError::Unavailable { .. } = e {
                warn!("Skipping move of {}: {}", id, e);
                return Ok(Step::Skipped);
            }
            let message = e.to_string();
            if e.is_expected() {
                warn!("Move of {} failed: {}", id, message);
            } else {
                error!("Move of {} failed: {}", id, message);
            }
            db.update_move_status(id, MoveStatus::Error, Some(&message))?;
            db.append_move_history(id, "move", "error", Some(&message))?;
            Ok(Step::Failed)
        }
    }
}

fn try_move(db: &Database, cache: &ChecksumCache<'_>, row: &MovePlanEntry) -> Result<Step, Error> {
    let volumes = cache.volumes();
    let planned = row.checksum.as_str();
    let Some(move_to) = &row.move_to else {
        return Err(FileError::Integrity("no move target planned".to_string()).into());
    };
    let src = volumes.locate(&row.identity)?;
    let dst = volumes.locate(move_to)?;

    if !src.exists() {
        if cache.get_or_compute_with_invalidation(&dst)?.as_deref() == Some(planned) {
            debug!("{} was already moved to {}", src.display(), dst.display());
            cache.invalidate(&row.identity)?;
            return Ok(Step::Done);
        }
        return Err(FileError::NotFound(src).into());
    }

    let current = cache.get_or_compute_with_invalidation(&src)?;
    if current.as_deref() != Some(planned) {
        return Err(FileError::Integrity(format!(
            "{} changed since planning (planned {}, now {})",
            src.display(),
            planned,
            current.as_deref().unwrap_or("missing")
        ))
        .into());
    }

    let Some(keeper) = db.get_keeper(planned)? else {
        return Err(FileError::Integrity(format!("no keeper recorded for {}", planned)).into());
    };
    let Some(keeper_path) = volumes.reconstruct(&keeper.identity) else {
        warn!("Keeper {} not available; skipping move of {}", keeper.identity, row.identity);
        return Ok(Step::Skipped);
    };
    if cache.get_or_compute_with_invalidation(&keeper_path)?.as_deref() != Some(planned) {
        return Err(FileError::Integrity(format!(
            "keeper {} is missing or changed",
            keeper_path.display()
        ))
        .into());
    }

    if dst.exists() {
        if cache.get_or_compute_with_invalidation(&dst)?.as_deref() != Some(planned) {
            return Err(FileError::Integrity(format!(
                "{} already exists with different content",
                dst.display()
            ))
            .into());
        }
        fs::remove_file(&src).map_err(|e| FileError::io(&src, e))?;
        debug!("{} already present at {}; removed original", src.display(), dst.display());
    } else {
        let outcome = transfer_file(&src, &dst, TransferMode::Move, Some(planned))?;
        if !outcome.matches(planned) {
            return Err(FileError::Integrity(format!(
                "checksum mismatch moving {} (planned {}, source {}, destination {})",
                src.display(),
                planned,
                outcome.src_checksum,
                outcome.dst_checksum
            ))
            .into());
        }
        debug!("Moved {} -> {} ({:?})", src.display(), dst.display(), outcome.method);
    }

    let metadata = fs::metadata(&dst).map_err(|e| FileError::io(&dst, e))?;
    let (size, last_modified) = fingerprint(&metadata);
    cache.insert_or_update(move_to, size, last_modified, planned)?;
    cache.invalidate(&row.identity)?;
    Ok(Step::Done)
}

/// Confirm moved files reached their target and left their origin, and that
/// every keeper is still intact.
pub fn verify_moves(
    db: &Database,
    cache: &ChecksumCache<'_>,
    threads: usize,
    reporter: &dyn ProgressReporter,
) -> Result<MoveVerifySummary, Error> {
    let rows = db.list_move_plan(&[MoveStatus::Moved, MoveStatus::Keeper])?;
    info!("Verifying {} moved files and keepers", rows.len());

    let progress = PhaseProgress::start(reporter, Phase::Verify, rows.len());
    let pool = thread_pool(threads)?;
    let outcomes: Vec<(bool, Step)> = pool.install(|| {
        rows.par_iter()
            .map(|row| {
                let step = verify_one(db, cache, row).map(|s| (row.is_keeper, s));
                progress.tick();
                step
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    progress.finish();

    let mut summary = MoveVerifySummary::default();
    for outcome in outcomes {
        match outcome {
            (true, Step::Done) => summary.keepers += 1,
            (false, Step::Done) => summary.verified += 1,
            (_, Step::Skipped) => summary.skipped += 1,
            (_, Step::Failed) => summary.errors += 1,
        }
    }
    info!(
        "Move verification: {} verified, {} keepers intact, {} errors, {} skipped",
        summary.verified, summary.keepers, summary.errors, summary.skipped
    );
    Ok(summary)
}

fn verify_one(db: &Database, cache: &ChecksumCache<'_>, row: &MovePlanEntry) -> Result<Step, Error> {
    let volumes = cache.volumes();
    let id = &row.identity;
    let problem = if row.is_keeper {
        let Some(path) = volumes.reconstruct(id) else {
            return Ok(Step::Skipped);
        };
        match fresh_checksum(cache, &path)? {
            Some(checksum) if checksum == row.checksum => None,
            Some(_) => Some(format!("keeper {} changed", path.display())),
            None => Some(format!("keeper {} is missing", path.display())),
        }
    } else {
        let Some(move_to) = &row.move_to else {
            return Ok(Step::Skipped);
        };
        let (Some(src), Some(dst)) = (volumes.reconstruct(id), volumes.reconstruct(move_to)) else {
            warn!("Volume not available; cannot verify move of {}", id);
            return Ok(Step::Skipped);
        };
        match fresh_checksum(cache, &dst)? {
            _ if src.exists() => Some(format!("{} still exists at its original location", src.display())),
            Some(checksum) if checksum == row.checksum => None,
            Some(checksum) => Some(format!(
                "{} has checksum {}, planned {}",
                dst.display(),
                checksum,
                row.checksum
            )),
            None => Some(format!("{} is missing", dst.display())),
        }
    };

    match problem {
        None if row.is_keeper => Ok(Step::Done),
        None => {
            db.update_move_status(id, MoveStatus::Verified, None)?;
            db.append_move_history(id, "verify", "verified", None)?;
            Ok(Step::Done)
        }
        Some(message) => {
            warn!("Move verification of {} failed: {}", id, message);
            db.update_move_status(id, MoveStatus::Error, Some(&message))?;
            db.append_move_history(id, "verify", "error", Some(&message))?;
            Ok(Step::Failed)
        }
    }
}

/// Re-read checksum; unreadable files count as missing.
fn fresh_checksum(cache: &ChecksumCache<'_>, path: &Path) -> Result<Option<String>, Error> {
    match cache.recompute(path) {
        Ok(checksum) => Ok(checksum),
        Err(e) => {
            let e = e.into_file_error()?;
            warn!("Cannot read {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

fn file_name(relative_path: &str) -> &str {
    relative_path.rsplit('/').next().unwrap_or(relative_path)
}
