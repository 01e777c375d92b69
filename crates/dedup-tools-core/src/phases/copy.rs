use super::{disambiguate, join_relative, thread_pool, PhaseProgress};
use crate::error::{Error, FileError};
use crate::hasher::ChecksumCache;
use crate::progress::{Phase, ProgressReporter};
use crate::storage::models::{CopyStatus, CopyStatusRow, FileRecord, FileRole};
use crate::storage::Database;
use crate::transfer::{transfer_file, TransferMode};
use crate::volume::{normalize, FileIdentity};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// New copies go under the first root; the others only count as places
    /// where an earlier copy may live.
    pub dest_roots: Vec<PathBuf>,
    pub threads: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: usize,
    pub bytes_copied: u64,
    /// Marked done because the content was already at the destination.
    pub deduplicated: usize,
    pub unavailable: usize,
    pub errors: usize,
    /// `done` rows reset to `pending` because their copy disappeared.
    pub reconciled: usize,
}

enum CopyOutcome {
    Copied(u64),
    Deduplicated,
    Unavailable,
    Failed,
}

/// What a candidate target path holds right now.
enum Slot {
    Free,
    /// Already holds the content being copied.
    Holds,
    /// An earlier copy of ours whose content no `done` row relies on.
    Stale,
    /// Foreign, or content that `done` rows point at.
    Occupied,
}

#[derive(Default)]
struct Claims {
    /// checksum -> destination file that holds, or is being written with, it.
    by_checksum: HashMap<String, FileIdentity>,
    /// Target paths handed to a worker during this run.
    targets: HashSet<PathBuf>,
}

struct CopyRun<'a, 'c> {
    db: &'a Database,
    cache: &'a ChecksumCache<'c>,
    target_root: PathBuf,
    dest_roots: Vec<PathBuf>,
    claims: Mutex<Claims>,
}

/// Copy every pending source file whose content is not yet at the
/// destination. Interrupted and failed rows are retried and `done` rows are
/// reconciled against the disk first.
///
/// A new copy goes to the source's relative path under the first
/// destination root. When that path is taken by other content, the file
/// name gets a checksum prefix instead; files that `done` rows point at are
/// never overwritten.
pub fn run_copy(
    db: &Database,
    cache: &ChecksumCache<'_>,
    options: &CopyOptions,
    reporter: &dyn ProgressReporter,
) -> Result<CopySummary, Error> {
    let Some(first) = options.dest_roots.first() else {
        return Err(Error::InvalidArgument(
            "at least one destination directory is required".to_string(),
        ));
    };
    fs::create_dir_all(first)?;
    let target_root = normalize(first)?;
    if cache.volumes().identity(&target_root).is_none() {
        return Err(Error::InvalidArgument(format!(
            "destination {} is not on a known volume",
            target_root.display()
        )));
    }

    let run = CopyRun {
        db,
        cache,
        target_root,
        dest_roots: options.dest_roots.clone(),
        claims: Mutex::new(Claims::default()),
    };

    let interrupted = db.reset_in_progress()?;
    let retried = db.reset_errors()?;
    if interrupted + retried > 0 {
        info!("Requeued {} interrupted and {} failed files", interrupted, retried);
    }
    let mut summary = CopySummary {
        reconciled: run.reconcile_done()?,
        ..CopySummary::default()
    };

    let pending = db.list_copy_status(Some(CopyStatus::Pending))?;
    info!("{} files pending copy", pending.len());

    let progress = PhaseProgress::start(reporter, Phase::Copy, pending.len());
    let pool = thread_pool(options.threads)?;
    let outcomes: Vec<CopyOutcome> = pool.install(|| {
        pending
            .par_iter()
            .map(|row| {
                let outcome = run.copy_one(row);
                progress.tick();
                outcome
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    let elapsed = progress.finish();

    for outcome in outcomes {
        match outcome {
            CopyOutcome::Copied(bytes) => {
                summary.copied += 1;
                summary.bytes_copied += bytes;
            }
            CopyOutcome::Deduplicated => summary.deduplicated += 1,
            CopyOutcome::Unavailable => summary.unavailable += 1,
            CopyOutcome::Failed => summary.errors += 1,
        }
    }
    info!(
        "Copy phase done in {:.2}s: {} copied ({} bytes), {} deduplicated, {} unavailable, {} errors",
        elapsed,
        summary.copied,
        summary.bytes_copied,
        summary.deduplicated,
        summary.unavailable,
        summary.errors
    );
    Ok(summary)
}

impl CopyRun<'_, '_> {
    /// Reset `done` rows whose content can no longer be found at the destination.
    fn reconcile_done(&self) -> Result<usize, Error> {
        let done = self.db.list_copy_status(Some(CopyStatus::Done))?;
        let mut reset = 0;
        for row in &done {
            if self.destination_copy_exists(row)? {
                continue;
            }
            warn!("Destination copy of {} is missing or changed; requeueing", row.identity);
            self.db.set_copy_status(
                &row.identity,
                CopyStatus::Pending,
                None,
                None,
                Some("destination copy missing or changed; will retry"),
            )?;
            reset += 1;
        }
        if reset > 0 {
            info!("Reconciliation reset {} of {} done files", reset, done.len());
        }
        Ok(reset)
    }

    /// Whether the content of a `done` row is still somewhere at the
    /// destination. A row whose recorded copy changed is pointed at another
    /// unchanged copy when there is one.
    fn destination_copy_exists(&self, row: &CopyStatusRow) -> Result<bool, Error> {
        let Some(checksum) = &row.checksum else {
            return Ok(row
                .dest
                .as_ref()
                .and_then(|dest| self.cache.volumes().reconstruct(dest))
                .into_iter()
                .chain(
                    self.dest_roots
                        .iter()
                        .map(|root| join_relative(root, &row.identity.relative_path)),
                )
                .any(|path| path.is_file()));
        };

        if let Some(dest) = &row.dest {
            match self.cache.volumes().locate(dest) {
                Ok(path) => {
                    if self.holds(&path, checksum)? {
                        return Ok(true);
                    }
                }
                Err(e) => {
                    debug!("Keeping {} done: {}", row.identity, e);
                    return Ok(true);
                }
            }
        }

        match self.find_existing(checksum)? {
            Some(existing) => {
                info!("Content of {} found at {}; updating its destination", row.identity, existing);
                self.mark_done(&row.identity, checksum, &existing)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether the file at `path` currently has content `checksum`.
    fn holds(&self, path: &Path, checksum: &str) -> Result<bool, Error> {
        match self.cache.get_or_compute_with_invalidation(path) {
            Ok(present) => Ok(present.as_deref() == Some(checksum)),
            Err(e) => {
                let e = e.into_file_error()?;
                warn!("Cannot read {}: {}", path.display(), e);
                Ok(false)
            }
        }
    }

    /// A destination or pool file that still holds `checksum` unchanged.
    fn find_existing(&self, checksum: &str) -> Result<Option<FileIdentity>, Error> {
        if let Some(id) = self
            .cache
            .find_valid_in_role(FileRole::DestinationPool, checksum)?
        {
            return Ok(Some(id));
        }
        self.cache.find_valid_in_role(FileRole::Destination, checksum)
    }

    fn copy_one(&self, row: &CopyStatusRow) -> Result<CopyOutcome, Error> {
        let id = &row.identity;
        let result = self.cache.volumes().locate(id).map_err(Error::from).and_then(|src| {
            self.db
                .set_copy_status(id, CopyStatus::InProgress, None, None, None)?;
            self.copy_or_skip(id, &src)
        });
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.record_failure(id, e.into_file_error()?),
        }
    }

    fn record_failure(&self, id: &FileIdentity, e: FileError) -> Result<CopyOutcome, Error> {
        if let FileError::Unavailable { .. } = e {
            warn!("Skipping {}: {}", id, e);
            return Ok(CopyOutcome::Unavailable);
        }
        if e.is_expected() {
            warn!("Copy of {} failed: {}", id, e);
        } else {
            error!("Copy of {} failed: {}", id, e);
        }
        self.db
            .set_copy_status(id, CopyStatus::Error, None, None, Some(&e.to_string()))?;
        Ok(CopyOutcome::Failed)
    }

    fn copy_or_skip(&self, id: &FileIdentity, src: &Path) -> Result<CopyOutcome, Error> {
        let Some(checksum) = self.cache.get_or_compute_with_invalidation(src)? else {
            return Err(FileError::NotFound(src.to_path_buf()).into());
        };

        if let Some(existing) = self.find_existing(&checksum)? {
            debug!("{} already at destination as {}", id, existing);
            self.mark_done(id, &checksum, &existing)?;
            return Ok(CopyOutcome::Deduplicated);
        }

        for attempt in 0.. {
            let relative = disambiguate(&id.relative_path, &checksum, attempt);
            let target = join_relative(&self.target_root, &relative);
            let Some(target_id) = self.cache.volumes().identity(&target) else {
                return Err(FileError::Integrity(format!(
                    "destination {} is not on a known volume",
                    target.display()
                ))
                .into());
            };

            let slot = self.inspect(&target, &target_id, &checksum)?;
            if let Slot::Occupied = slot {
                debug!("{} is taken; trying another name for {}", target.display(), id);
                continue;
            }

            {
                let mut claims = lock(&self.claims);
                if let Some(holder) = claims.by_checksum.get(&checksum).cloned() {
                    drop(claims);
                    debug!("{} has the same content as {}, already copied this run", id, holder);
                    self.mark_done(id, &checksum, &holder)?;
                    return Ok(CopyOutcome::Deduplicated);
                }
                if !claims.targets.insert(target.clone()) {
                    continue;
                }
                claims.by_checksum.insert(checksum.clone(), target_id.clone());
            }

            let result = match slot {
                Slot::Holds => {
                    debug!("{} already holds the content of {}", target.display(), id);
                    self.register_destination(id, &target, &target_id, &checksum)
                        .and_then(|_| self.mark_done(id, &checksum, &target_id))
                        .map(|()| CopyOutcome::Deduplicated)
                }
                _ => self.write_target(id, src, &target, &target_id, &checksum),
            };
            if result.is_err() {
                let mut claims = lock(&self.claims);
                if claims.by_checksum.get(&checksum) == Some(&target_id) {
                    claims.by_checksum.remove(&checksum);
                }
                claims.targets.remove(&target);
            }
            return result;
        }
        Err(Error::Other(format!("no free destination name for {}", id)))
    }

    fn inspect(&self, target: &Path, target_id: &FileIdentity, checksum: &str) -> Result<Slot, Error> {
        match fs::symlink_metadata(target) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Slot::Free),
            Err(e) => return Err(FileError::io(target, e).into()),
            Ok(metadata) if !metadata.is_file() => return Ok(Slot::Occupied),
            Ok(_) => {}
        }
        // Path-level check: our catalogued copy, unchanged, with this content.
        if self.cache.exists_at_destination(target_id)?
            && self.cache.get(target_id)?.as_deref() == Some(checksum)
        {
            return Ok(Slot::Holds);
        }

        let Some(present) = self.cache.get_or_compute_with_invalidation(target)? else {
            return Ok(Slot::Free);
        };
        if present == checksum {
            return Ok(Slot::Holds);
        }
        let ours = self
            .db
            .get_file_record(FileRole::Destination, target_id)?
            .is_some();
        if ours && !self.db.has_done_copies_at(target_id, &present)? {
            return Ok(Slot::Stale);
        }
        Ok(Slot::Occupied)
    }

    fn write_target(
        &self,
        id: &FileIdentity,
        src: &Path,
        target: &Path,
        target_id: &FileIdentity,
        checksum: &str,
    ) -> Result<CopyOutcome, Error> {
        if target.exists() {
            debug!("Replacing stale copy at {}", target.display());
        }
        let outcome = transfer_file(src, target, TransferMode::Copy, Some(checksum))?;
        if !outcome.matches(checksum) {
            return Err(FileError::Integrity(format!(
                "checksum mismatch copying {} (expected {}, source {}, destination {})",
                src.display(),
                checksum,
                outcome.src_checksum,
                outcome.dst_checksum
            ))
            .into());
        }

        let bytes = self.register_destination(id, target, target_id, checksum)?;
        self.mark_done(id, checksum, target_id)?;
        debug!("Copied {} -> {}", src.display(), target.display());
        Ok(CopyOutcome::Copied(bytes))
    }

    /// Catalog the destination file and cache its checksum.
    fn register_destination(
        &self,
        id: &FileIdentity,
        target: &Path,
        target_id: &FileIdentity,
        checksum: &str,
    ) -> Result<u64, Error> {
        let metadata = fs::metadata(target).map_err(|e| FileError::io(target, e))?;
        let mut record = FileRecord::from_metadata(target_id.clone(), &metadata);
        record.root_relative_path = Some(id.relative_path.clone());
        self.db
            .upsert_file_records(FileRole::Destination, std::slice::from_ref(&record))?;
        self.cache
            .insert_or_update(target_id, record.size, record.last_modified, checksum)?;
        Ok(metadata.len())
    }

    fn mark_done(&self, id: &FileIdentity, checksum: &str, dest: &FileIdentity) -> Result<(), Error> {
        self.db
            .set_copy_status(id, CopyStatus::Done, Some(checksum), Some(dest), None)?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
