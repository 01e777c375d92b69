use super::sha256;
use crate::error::{Error, FileError};
use crate::storage::models::{fingerprint, ChecksumCacheEntry, FileRole};
use crate::storage::{attached_table_exists, now_secs, Database};
use crate::volume::{FileIdentity, VolumeIdentity};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{self, Metadata};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const IMPORT_SCHEMA: &str = "importdb";
const MIN_IMPORT_BATCH: i64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    Unchanged,
    Invalidated,
    Unavailable,
}

/// Content hashes keyed by file identity, validated against size and mtime.
///
/// A cached checksum is only returned after the file's current size and
/// whole-second mtime have been confirmed to match the values it was
/// computed from. Anything else triggers exactly one rehash.
pub struct ChecksumCache<'a> {
    db: &'a Database,
    volumes: &'a VolumeIdentity,
    slow_hash_warning: Duration,
    hashes_computed: AtomicU64,
}

impl<'a> ChecksumCache<'a> {
    pub fn new(db: &'a Database, volumes: &'a VolumeIdentity) -> Self {
        Self {
            db,
            volumes,
            slow_hash_warning: Duration::from_secs(30),
            hashes_computed: AtomicU64::new(0),
        }
    }

    pub fn with_slow_hash_warning(mut self, threshold: Duration) -> Self {
        self.slow_hash_warning = threshold;
        self
    }

    pub fn volumes(&self) -> &VolumeIdentity {
        self.volumes
    }

    /// Number of files hashed (cache misses) by this instance.
    pub fn hashes_computed(&self) -> u64 {
        self.hashes_computed.load(Ordering::Relaxed)
    }

    /// Cached checksum for `id` if its latest row is valid. Never touches the filesystem.
    pub fn get(&self, id: &FileIdentity) -> Result<Option<String>, Error> {
        Ok(self
            .entry(id)?
            .filter(|entry| entry.is_valid)
            .map(|entry| entry.checksum))
    }

    /// Latest cache row for `id`, valid or not.
    pub fn entry(&self, id: &FileIdentity) -> Result<Option<ChecksumCacheEntry>, Error> {
        let entry = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT uid, relative_path, size, last_modified, checksum, imported_at, \
                        last_validated, is_valid \
                 FROM checksumdb.checksum_cache WHERE uid = ?1 AND relative_path = ?2 \
                 ORDER BY last_validated DESC LIMIT 1",
                params![id.uid, id.relative_path],
                |row| {
                    Ok(ChecksumCacheEntry {
                        identity: FileIdentity::new(
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                        ),
                        size: row.get::<_, Option<i64>>(2)?.unwrap_or(-1),
                        last_modified: row.get::<_, Option<i64>>(3)?.unwrap_or(-1),
                        checksum: row.get(4)?,
                        imported_at: row.get(5)?,
                        last_validated: row.get(6)?,
                        is_valid: row.get::<_, i64>(7)? == 1,
                    })
                },
            )
            .optional()
        })?;
        Ok(entry)
    }

    /// Checksum of the file at `path`, from cache when size and mtime still
    /// match, otherwise freshly computed and stored. `None` when the path is
    /// not on a known volume or the file does not exist.
    pub fn get_or_compute_with_invalidation(&self, path: &Path) -> Result<Option<String>, Error> {
        let Some(id) = self.volumes.identity(path) else {
            debug!("No volume identity for {}, not caching", path.display());
            return Ok(None);
        };
        let Some(metadata) = stat(path)? else {
            debug!("{} does not exist", path.display());
            return Ok(None);
        };

        let (size, last_modified) = fingerprint(&metadata);
        if let Some(entry) = self.entry(&id)? {
            if entry.is_valid && entry.size == size && entry.last_modified == last_modified {
                debug!("Checksum cache hit for {}", id);
                return Ok(Some(entry.checksum));
            }
        }

        self.compute_and_store(path, &id, &metadata).map(Some)
    }

    /// Rehash the file at `path` regardless of what the cache holds.
    pub fn recompute(&self, path: &Path) -> Result<Option<String>, Error> {
        let Some(metadata) = stat(path)? else {
            return Ok(None);
        };
        let checksum = match self.volumes.identity(path) {
            Some(id) => self.compute_and_store(path, &id, &metadata)?,
            None => self.timed_hash(path)?,
        };
        Ok(Some(checksum))
    }

    fn compute_and_store(
        &self,
        path: &Path,
        id: &FileIdentity,
        metadata: &Metadata,
    ) -> Result<String, Error> {
        let checksum = self.timed_hash(path)?;
        let (size, last_modified) = fingerprint(metadata);
        self.insert_or_update(id, size, last_modified, &checksum)?;
        Ok(checksum)
    }

    fn timed_hash(&self, path: &Path) -> Result<String, Error> {
        let started = Instant::now();
        let checksum = sha256::hash_file(path).map_err(|e| FileError::io(path, e))?;
        self.hashes_computed.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed();
        if elapsed > self.slow_hash_warning {
            warn!(
                "Checksum of {} took {:.1}s",
                path.display(),
                elapsed.as_secs_f64()
            );
        }
        Ok(checksum)
    }

    /// Upsert keyed on identity; always marks the row valid.
    pub fn insert_or_update(
        &self,
        id: &FileIdentity,
        size: i64,
        last_modified: i64,
        checksum: &str,
    ) -> Result<(), Error> {
        let now = now_secs();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checksumdb.checksum_cache \
                 (uid, relative_path, size, last_modified, checksum, imported_at, last_validated, is_valid) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1) \
                 ON CONFLICT(uid, relative_path) DO UPDATE SET \
                     size = excluded.size, \
                     last_modified = excluded.last_modified, \
                     checksum = excluded.checksum, \
                     last_validated = excluded.last_validated, \
                     is_valid = 1",
                params![id.uid, id.relative_path, size, last_modified, checksum, now],
            )
        })?;
        Ok(())
    }

    /// Soft-invalidate. Idempotent.
    pub fn invalidate(&self, id: &FileIdentity) -> Result<(), Error> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE checksumdb.checksum_cache SET is_valid = 0 \
                 WHERE uid = ?1 AND relative_path = ?2",
                params![id.uid, id.relative_path],
            )
        })?;
        Ok(())
    }

    /// Whether the destination file `id` is catalogued with a valid cache
    /// entry that the file on disk still matches by size and mtime. A file
    /// that changed or disappeared has its entry invalidated; one on an
    /// unmounted volume counts as absent.
    pub fn exists_at_destination(&self, id: &FileIdentity) -> Result<bool, Error> {
        let cached: Option<(i64, i64)> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT c.size, c.last_modified FROM destination_files d \
                 JOIN checksumdb.checksum_cache c \
                   ON d.uid = c.uid AND d.relative_path = c.relative_path \
                 WHERE d.uid = ?1 AND d.relative_path = ?2 AND c.is_valid = 1 LIMIT 1",
                params![id.uid, id.relative_path],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?.unwrap_or(-1),
                        row.get::<_, Option<i64>>(1)?.unwrap_or(-1),
                    ))
                },
            )
            .optional()
        })?;
        let Some((size, last_modified)) = cached else {
            return Ok(false);
        };
        let confirmation = self.confirm(FileRole::Destination, id, size, last_modified)?;
        Ok(confirmation == Confirmation::Unchanged)
    }

    /// Whether `checksum` is held by a destination-pool file that is still
    /// on disk unchanged.
    pub fn exists_at_destination_pool(&self, checksum: &str) -> Result<bool, Error> {
        Ok(self
            .find_valid_in_role(FileRole::DestinationPool, checksum)?
            .is_some())
    }

    /// First catalogued file of `role` holding `checksum` that still exists
    /// with the size and mtime the checksum was computed from. Candidates
    /// that fail the check are invalidated on the way. Files on volumes that
    /// are not mounted are skipped without invalidation.
    pub fn find_valid_in_role(
        &self,
        role: FileRole,
        checksum: &str,
    ) -> Result<Option<FileIdentity>, Error> {
        let sql = format!(
            "SELECT f.uid, f.relative_path, c.size, c.last_modified \
             FROM {} f \
             JOIN checksumdb.checksum_cache c \
               ON f.uid = c.uid AND f.relative_path = c.relative_path \
             WHERE c.checksum = ?1 AND c.is_valid = 1 \
             ORDER BY f.rowid",
            role.table()
        );
        let candidates: Vec<(FileIdentity, i64, i64)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![checksum], |row| {
                Ok((
                    FileIdentity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(-1),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(-1),
                ))
            })?;
            rows.collect()
        })?;

        for (id, cached_size, cached_mtime) in candidates {
            if self.confirm(role, &id, cached_size, cached_mtime)? == Confirmation::Unchanged {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Compare a cached fingerprint with the disk, invalidating the entry
    /// when the file is gone or changed.
    fn confirm(
        &self,
        role: FileRole,
        id: &FileIdentity,
        cached_size: i64,
        cached_mtime: i64,
    ) -> Result<Confirmation, Error> {
        let path = match self.volumes.locate(id) {
            Ok(path) => path,
            Err(e) => {
                debug!("Skipping {} candidate: {}", role, e);
                return Ok(Confirmation::Unavailable);
            }
        };
        match stat(&path)? {
            None => {
                warn!("{} file missing: {}; invalidating cache entry", role, path.display());
            }
            Some(metadata) => {
                let (size, last_modified) = fingerprint(&metadata);
                if size == cached_size && last_modified == cached_mtime {
                    return Ok(Confirmation::Unchanged);
                }
                warn!(
                    "{} file changed: {} (size {} vs {}, mtime {} vs {}); invalidating cache entry",
                    role,
                    path.display(),
                    size,
                    cached_size,
                    last_modified,
                    cached_mtime
                );
            }
        }
        self.invalidate(id)?;
        Ok(Confirmation::Invalidated)
    }

    /// Bulk-upsert every row of another store's `checksum_cache` table.
    /// The whole import is one transaction; a store without the table is
    /// rejected before anything is written.
    pub fn import_from(&self, source: &Path) -> Result<usize, Error> {
        if !source.is_file() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("checksum store {} does not exist", source.display()),
            )));
        }
        let source_str = source.to_string_lossy().into_owned();
        let imported = self.db.with_conn(|conn| {
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", IMPORT_SCHEMA),
                params![source_str],
            )?;
            let result = copy_imported_rows(conn);
            let detached = conn.execute_batch(&format!("DETACH DATABASE {}", IMPORT_SCHEMA));
            let imported = result?;
            detached?;
            Ok(imported)
        })?;

        match imported {
            Some(count) => {
                info!("Imported {} checksum entries from {}", count, source.display());
                Ok(count)
            }
            None => Err(Error::MissingTable {
                path: source.to_path_buf(),
                table: "checksum_cache",
            }),
        }
    }

    pub fn export_to(&self, target: &Path) -> Result<(), Error> {
        self.db.export_cache(target)?;
        info!("Exported checksum cache to {}", target.display());
        Ok(())
    }
}

fn copy_imported_rows(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    if !attached_table_exists(conn, IMPORT_SCHEMA, "checksum_cache")? {
        return Ok(None);
    }
    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {}.checksum_cache WHERE checksum IS NOT NULL",
            IMPORT_SCHEMA
        ),
        [],
        |row| row.get(0),
    )?;
    let batch_size = MIN_IMPORT_BATCH.max(total / 10);
    let now = now_secs();

    let tx = conn.unchecked_transaction()?;
    let mut imported = 0;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT OR REPLACE INTO checksumdb.checksum_cache \
             (uid, relative_path, size, last_modified, checksum, imported_at, last_validated, is_valid) \
             SELECT uid, relative_path, size, last_modified, checksum, ?3, \
                    COALESCE(last_validated, ?3), COALESCE(is_valid, 1) \
             FROM {}.checksum_cache WHERE checksum IS NOT NULL \
             ORDER BY rowid LIMIT ?1 OFFSET ?2",
            IMPORT_SCHEMA
        ))?;
        let mut offset = 0;
        while offset < total {
            imported += stmt.execute(params![batch_size, offset, now])?;
            debug!("Imported checksum batch at offset {}", offset);
            offset += batch_size;
        }
    }
    tx.commit()?;
    Ok(Some(imported))
}

fn stat(path: &Path) -> Result<Option<Metadata>, FileError> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FileError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_untracked_path_is_not_cached() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, "x").unwrap();
        let db = Database::open_in_memory().unwrap();
        let volumes = VolumeIdentity::empty();
        let cache = ChecksumCache::new(&db, &volumes);
        assert_eq!(cache.get_or_compute_with_invalidation(&file).unwrap(), None);
        assert_eq!(cache.hashes_computed(), 0);
    }

    #[test]
    fn test_missing_file_returns_none() {
        let tmp = tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let volumes = VolumeIdentity::empty().with_pseudo_volume(tmp.path()).unwrap();
        let cache = ChecksumCache::new(&db, &volumes);
        let result = cache
            .get_or_compute_with_invalidation(&tmp.path().join("nope"))
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_invalidated_entry_is_not_returned_by_get() {
        let db = Database::open_in_memory().unwrap();
        let volumes = VolumeIdentity::empty();
        let cache = ChecksumCache::new(&db, &volumes);
        let id = FileIdentity::new("vol", "a.txt");
        cache.insert_or_update(&id, 1, 100, "abc").unwrap();
        assert_eq!(cache.get(&id).unwrap().as_deref(), Some("abc"));

        cache.invalidate(&id).unwrap();
        cache.invalidate(&id).unwrap();
        assert_eq!(cache.get(&id).unwrap(), None);
        let entry = cache.entry(&id).unwrap().unwrap();
        assert!(!entry.is_valid);
        assert_eq!(entry.checksum, "abc");
    }
}
