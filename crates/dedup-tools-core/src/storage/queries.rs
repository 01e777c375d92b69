use super::models::*;
use super::sqlite::Database;
use crate::volume::FileIdentity;
use rusqlite::{params, OptionalExtension, Result, Row};
use tracing::debug;

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn optional_identity(uid: Option<String>, rel: Option<String>) -> Option<FileIdentity> {
    match (uid, rel) {
        (Some(uid), Some(rel)) => Some(FileIdentity::new(uid, rel)),
        _ => None,
    }
}

fn file_record_from_row(row: &Row<'_>) -> Result<FileRecord> {
    Ok(FileRecord {
        identity: FileIdentity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        size: row.get(2)?,
        last_modified: row.get(3)?,
        root_relative_path: row.get(4)?,
    })
}

fn copy_status_from_row(row: &Row<'_>) -> Result<CopyStatusRow> {
    Ok(CopyStatusRow {
        identity: FileIdentity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        status: row.get(2)?,
        checksum: row.get(3)?,
        dest: optional_identity(row.get(4)?, row.get(5)?),
        last_copy_attempt: row.get(6)?,
        error_message: row.get(7)?,
    })
}

fn move_plan_from_row(row: &Row<'_>) -> Result<MovePlanEntry> {
    Ok(MovePlanEntry {
        identity: FileIdentity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        checksum: row.get(2)?,
        move_to: optional_identity(row.get(3)?, row.get(4)?),
        status: row.get(5)?,
        error_message: row.get(6)?,
        is_keeper: row.get::<_, i64>(7)? != 0,
    })
}

const COPY_STATUS_COLUMNS: &str = "uid, relative_path, status, checksum, dest_uid, \
     dest_relative_path, last_copy_attempt, error_message";

const MOVE_PLAN_COLUMNS: &str = "uid, relative_path, checksum, move_to_uid, move_to_rel_path, \
     status, error_message, is_keeper";

impl Database {
    // ── File catalog ─────────────────────────────────────────────

    /// Last-write-wins upsert of scanned files. Existing rows keep their
    /// rowid, so catalog order stays the order files were first seen.
    pub fn upsert_file_records(&self, role: FileRole, records: &[FileRecord]) -> Result<usize> {
        let sql = format!(
            "INSERT INTO {} (uid, relative_path, size, last_modified, root_relative_path, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(uid, relative_path) DO UPDATE SET \
                 size = excluded.size, \
                 last_modified = excluded.last_modified, \
                 root_relative_path = excluded.root_relative_path, \
                 last_seen = excluded.last_seen",
            role.table()
        );
        let now = now_secs();
        let count = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for record in records {
                    count += stmt.execute(params![
                        record.identity.uid,
                        record.identity.relative_path,
                        record.size,
                        record.last_modified,
                        record.root_relative_path,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(count)
        })?;
        debug!("Upserted {} {} records", count, role);
        Ok(count)
    }

    pub fn get_file_record(&self, role: FileRole, id: &FileIdentity) -> Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT uid, relative_path, size, last_modified, root_relative_path \
             FROM {} WHERE uid = ?1 AND relative_path = ?2",
            role.table()
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![id.uid, id.relative_path], file_record_from_row)
                .optional()
        })
    }

    /// All records of a role in scan order.
    pub fn list_file_records(&self, role: FileRole) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT uid, relative_path, size, last_modified, root_relative_path \
             FROM {} ORDER BY rowid",
            role.table()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], file_record_from_row)?;
            rows.collect()
        })
    }

    pub fn count_file_records(&self, role: FileRole) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", role.table());
        self.with_conn(|conn| conn.query_row(&sql, [], |row| row.get(0)))
    }

    // ── Copy status ──────────────────────────────────────────────

    /// Register scanned source files. A file gets a fresh `pending` status
    /// when it is new or its size/mtime changed since the last scan; an
    /// unchanged file keeps whatever status it had.
    pub fn register_sources(&self, records: &[FileRecord]) -> Result<usize> {
        let now = now_secs();
        let queued = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut queued = 0;
            {
                let mut previous = tx.prepare_cached(
                    "SELECT size, last_modified FROM source_files \
                     WHERE uid = ?1 AND relative_path = ?2",
                )?;
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO source_files \
                     (uid, relative_path, size, last_modified, root_relative_path, last_seen) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(uid, relative_path) DO UPDATE SET \
                         size = excluded.size, \
                         last_modified = excluded.last_modified, \
                         root_relative_path = excluded.root_relative_path, \
                         last_seen = excluded.last_seen",
                )?;
                let mut requeue = tx.prepare_cached(
                    "INSERT INTO copy_status (uid, relative_path, status) VALUES (?1, ?2, 'pending') \
                     ON CONFLICT(uid, relative_path) DO UPDATE SET \
                         status = 'pending', checksum = NULL, dest_uid = NULL, \
                         dest_relative_path = NULL, error_message = NULL",
                )?;
                let mut ensure = tx.prepare_cached(
                    "INSERT OR IGNORE INTO copy_status (uid, relative_path, status) \
                     VALUES (?1, ?2, 'pending')",
                )?;

                for record in records {
                    let id = &record.identity;
                    let old: Option<(i64, i64)> = previous
                        .query_row(params![id.uid, id.relative_path], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })
                        .optional()?;
                    upsert.execute(params![
                        id.uid,
                        id.relative_path,
                        record.size,
                        record.last_modified,
                        record.root_relative_path,
                        now,
                    ])?;
                    if old == Some((record.size, record.last_modified)) {
                        queued += ensure.execute(params![id.uid, id.relative_path])?;
                    } else {
                        requeue.execute(params![id.uid, id.relative_path])?;
                        queued += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(queued)
        })?;
        debug!("{} source files queued for copy", queued);
        Ok(queued)
    }

    pub fn set_copy_status(
        &self,
        id: &FileIdentity,
        status: CopyStatus,
        checksum: Option<&str>,
        dest: Option<&FileIdentity>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO copy_status \
                 (uid, relative_path, status, checksum, dest_uid, dest_relative_path, \
                  last_copy_attempt, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(uid, relative_path) DO UPDATE SET \
                     status = excluded.status, \
                     checksum = COALESCE(excluded.checksum, copy_status.checksum), \
                     dest_uid = COALESCE(excluded.dest_uid, copy_status.dest_uid), \
                     dest_relative_path = COALESCE(excluded.dest_relative_path, copy_status.dest_relative_path), \
                     last_copy_attempt = excluded.last_copy_attempt, \
                     error_message = excluded.error_message",
                params![
                    id.uid,
                    id.relative_path,
                    status,
                    checksum,
                    dest.map(|d| d.uid.as_str()),
                    dest.map(|d| d.relative_path.as_str()),
                    now,
                    error_message,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get_copy_status(&self, id: &FileIdentity) -> Result<Option<CopyStatusRow>> {
        let sql = format!(
            "SELECT {} FROM copy_status WHERE uid = ?1 AND relative_path = ?2",
            COPY_STATUS_COLUMNS
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![id.uid, id.relative_path], copy_status_from_row)
                .optional()
        })
    }

    /// Whether any `done` row relies on `dest` holding `checksum`.
    pub fn has_done_copies_at(&self, dest: &FileIdentity, checksum: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM copy_status \
                 WHERE dest_uid = ?1 AND dest_relative_path = ?2 AND checksum = ?3 \
                   AND status = 'done' LIMIT 1",
                params![dest.uid, dest.relative_path, checksum],
                |_| Ok(()),
            )
            .optional()
        })
        .map(|found| found.is_some())
    }

    /// Status rows in catalog order, optionally filtered by status.
    pub fn list_copy_status(&self, status: Option<CopyStatus>) -> Result<Vec<CopyStatusRow>> {
        let sql = format!(
            "SELECT {} FROM copy_status WHERE ?1 IS NULL OR status = ?1 ORDER BY rowid",
            COPY_STATUS_COLUMNS
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status], copy_status_from_row)?;
            rows.collect()
        })
    }

    /// Rows left `in_progress` by an interrupted run go back to `pending`.
    pub fn reset_in_progress(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE copy_status SET status = 'pending', \
                 error_message = 'interrupted while in progress; will retry' \
                 WHERE status = 'in_progress'",
                [],
            )
        })
    }

    /// `error` rows go back to `pending` so a rerun retries them.
    pub fn reset_errors(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE copy_status SET status = 'pending' WHERE status = 'error'",
                [],
            )
        })
    }

    // ── Verification ─────────────────────────────────────────────

    pub fn clear_verification(&self, stage: VerifyStage) -> Result<usize> {
        let sql = format!("DELETE FROM {}", stage.table());
        self.with_conn(|conn| conn.execute(&sql, []))
    }

    pub fn record_shallow_result(&self, result: &ShallowResult) -> Result<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO verification_shallow_results \
                 (uid, relative_path, \"exists\", size_matched, last_modified_matched, \
                  expected_size, actual_size, expected_last_modified, actual_last_modified, \
                  verify_status, verify_error, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    result.identity.uid,
                    result.identity.relative_path,
                    result.exists,
                    result.size_matched,
                    result.last_modified_matched,
                    result.expected_size,
                    result.actual_size,
                    result.expected_last_modified,
                    result.actual_last_modified,
                    result.status,
                    result.error,
                    now,
                ],
            )
        })?;
        Ok(())
    }

    pub fn record_deep_result(&self, result: &DeepResult) -> Result<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO verification_deep_results \
                 (uid, relative_path, checksum_matched, expected_checksum, src_checksum, \
                  dst_checksum, verify_status, verify_error, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    result.identity.uid,
                    result.identity.relative_path,
                    result.checksum_matched,
                    result.expected_checksum,
                    result.src_checksum,
                    result.dst_checksum,
                    result.status,
                    result.error,
                    now,
                ],
            )
        })?;
        Ok(())
    }

    pub fn list_shallow_results(&self) -> Result<Vec<ShallowResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uid, relative_path, \"exists\", size_matched, last_modified_matched, \
                        expected_size, actual_size, expected_last_modified, actual_last_modified, \
                        verify_status, verify_error \
                 FROM verification_shallow_results ORDER BY uid, relative_path",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ShallowResult {
                    identity: FileIdentity::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ),
                    exists: row.get(2)?,
                    size_matched: row.get(3)?,
                    last_modified_matched: row.get(4)?,
                    expected_size: row.get(5)?,
                    actual_size: row.get(6)?,
                    expected_last_modified: row.get(7)?,
                    actual_last_modified: row.get(8)?,
                    status: row.get(9)?,
                    error: row.get(10)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn list_deep_results(&self) -> Result<Vec<DeepResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uid, relative_path, checksum_matched, expected_checksum, src_checksum, \
                        dst_checksum, verify_status, verify_error \
                 FROM verification_deep_results ORDER BY uid, relative_path",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DeepResult {
                    identity: FileIdentity::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ),
                    checksum_matched: row.get(2)?,
                    expected_checksum: row.get(3)?,
                    src_checksum: row.get(4)?,
                    dst_checksum: row.get(5)?,
                    status: row.get(6)?,
                    error: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }

    // ── Dedup move plan ──────────────────────────────────────────

    /// Drop stale plans. Keeper, moved and verified rows are never touched.
    pub fn delete_planned_moves(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM dedup_move_plan WHERE status = 'planned'", [])
        })
    }

    /// Insert new plan rows; a file that already has a row keeps it.
    pub fn insert_move_plan(&self, entries: &[MovePlanEntry]) -> Result<usize> {
        let now = now_secs();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO dedup_move_plan \
                     (uid, relative_path, checksum, move_to_uid, move_to_rel_path, status, \
                      error_message, planned_at, updated_at, is_keeper) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9) \
                     ON CONFLICT(uid, relative_path) DO NOTHING",
                )?;
                for entry in entries {
                    count += stmt.execute(params![
                        entry.identity.uid,
                        entry.identity.relative_path,
                        entry.checksum,
                        entry.move_to.as_ref().map(|m| m.uid.as_str()),
                        entry.move_to.as_ref().map(|m| m.relative_path.as_str()),
                        entry.status,
                        entry.error_message,
                        now,
                        entry.is_keeper,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(count)
        })
    }

    pub fn get_move_plan(&self, id: &FileIdentity) -> Result<Option<MovePlanEntry>> {
        let sql = format!(
            "SELECT {} FROM dedup_move_plan WHERE uid = ?1 AND relative_path = ?2",
            MOVE_PLAN_COLUMNS
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![id.uid, id.relative_path], move_plan_from_row)
                .optional()
        })
    }

    /// Plan rows whose status is one of `statuses` (all rows when empty).
    pub fn list_move_plan(&self, statuses: &[MoveStatus]) -> Result<Vec<MovePlanEntry>> {
        let filter = if statuses.is_empty() {
            String::new()
        } else {
            let list: Vec<String> = statuses
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect();
            format!("WHERE status IN ({})", list.join(", "))
        };
        let sql = format!(
            "SELECT {} FROM dedup_move_plan {} ORDER BY rowid",
            MOVE_PLAN_COLUMNS, filter
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], move_plan_from_row)?;
            rows.collect()
        })
    }

    pub fn get_keeper(&self, checksum: &str) -> Result<Option<MovePlanEntry>> {
        let sql = format!(
            "SELECT {} FROM dedup_move_plan WHERE checksum = ?1 AND is_keeper = 1 \
             ORDER BY rowid LIMIT 1",
            MOVE_PLAN_COLUMNS
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![checksum], move_plan_from_row)
                .optional()
        })
    }

    pub fn update_move_status(
        &self,
        id: &FileIdentity,
        status: MoveStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE dedup_move_plan SET status = ?3, error_message = ?4, updated_at = ?5, \
                     moved_at = CASE WHEN ?3 = 'moved' THEN ?5 ELSE moved_at END \
                 WHERE uid = ?1 AND relative_path = ?2",
                params![id.uid, id.relative_path, status, error_message, now],
            )
        })?;
        Ok(())
    }

    /// Append an audit row. History is never updated or deleted.
    pub fn append_move_history(
        &self,
        id: &FileIdentity,
        action: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dedup_move_history \
                 (uid, relative_path, attempted_at, action, result, error_message) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id.uid, id.relative_path, now, action, result, error_message],
            )
        })?;
        Ok(())
    }

    pub fn list_move_history(&self) -> Result<Vec<MoveHistoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, uid, relative_path, attempted_at, action, result, error_message \
                 FROM dedup_move_history ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(MoveHistoryEntry {
                    id: row.get(0)?,
                    identity: FileIdentity::new(
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ),
                    attempted_at: row.get(3)?,
                    action: row.get(4)?,
                    result: row.get(5)?,
                    error_message: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    // ── Compare results ──────────────────────────────────────────

    pub fn clear_compare_results(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM compare_results_left_missing;
                 DELETE FROM compare_results_right_missing;
                 DELETE FROM compare_results_identical;
                 DELETE FROM compare_results_different;",
            )
        })
    }

    pub fn insert_missing_files(&self, side: CompareSide, files: &[MissingFile]) -> Result<usize> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (uid, relative_path, size, last_modified, checksum) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            side.missing_table()
        );
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for file in files {
                    count += stmt.execute(params![
                        file.identity.uid,
                        file.identity.relative_path,
                        file.size,
                        file.last_modified,
                        file.checksum,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(count)
        })
    }

    pub fn insert_identical_pairs(&self, pairs: &[IdenticalPair]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO compare_results_identical \
                     (left_uid, left_relative_path, right_uid, right_relative_path, checksum) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for pair in pairs {
                    count += stmt.execute(params![
                        pair.left.uid,
                        pair.left.relative_path,
                        pair.right.uid,
                        pair.right.relative_path,
                        pair.checksum,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(count)
        })
    }

    pub fn insert_different_pairs(&self, pairs: &[DifferentPair]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO compare_results_different \
                     (pool_relative_path, left_uid, left_relative_path, left_checksum, \
                      right_uid, right_relative_path, right_checksum) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for pair in pairs {
                    count += stmt.execute(params![
                        pair.pool_relative_path,
                        pair.left.uid,
                        pair.left.relative_path,
                        pair.left_checksum,
                        pair.right.uid,
                        pair.right.relative_path,
                        pair.right_checksum,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(count)
        })
    }

    pub fn list_missing_files(&self, side: CompareSide) -> Result<Vec<MissingFile>> {
        let sql = format!(
            "SELECT uid, relative_path, size, last_modified, checksum FROM {} \
             ORDER BY uid, relative_path",
            side.missing_table()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(MissingFile {
                    identity: FileIdentity::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ),
                    size: row.get(2)?,
                    last_modified: row.get(3)?,
                    checksum: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn list_identical_pairs(&self) -> Result<Vec<IdenticalPair>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT left_uid, left_relative_path, right_uid, right_relative_path, checksum \
                 FROM compare_results_identical ORDER BY left_uid, left_relative_path",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(IdenticalPair {
                    left: FileIdentity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    right: FileIdentity::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
                    checksum: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn list_different_pairs(&self) -> Result<Vec<DifferentPair>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pool_relative_path, left_uid, left_relative_path, left_checksum, \
                        right_uid, right_relative_path, right_checksum \
                 FROM compare_results_different ORDER BY pool_relative_path",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(DifferentPair {
                    pool_relative_path: row.get(0)?,
                    left: FileIdentity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                    left_checksum: row.get(3)?,
                    right: FileIdentity::new(row.get::<_, String>(4)?, row.get::<_, String>(5)?),
                    right_checksum: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    // ── Summary ──────────────────────────────────────────────────

    /// `(status, count)` pairs for a status-bearing table.
    pub fn status_counts(&self, table: &str) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status ORDER BY status",
            table
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    /// `(verify_status, count)` pairs for one verification stage.
    pub fn verification_counts(&self, stage: VerifyStage) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT verify_status, COUNT(*) FROM {} GROUP BY verify_status ORDER BY verify_status",
            stage.table()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    /// Rows of `table` whose status is not one of `ok_statuses`.
    pub fn problem_files(&self, table: &str, ok_statuses: &[&str]) -> Result<Vec<ProblemFile>> {
        let list: Vec<String> = ok_statuses.iter().map(|s| format!("'{}'", s)).collect();
        let sql = format!(
            "SELECT uid, relative_path, status, error_message FROM {} \
             WHERE status NOT IN ({}) ORDER BY rowid",
            table,
            list.join(", ")
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(ProblemFile {
                    uid: row.get(0)?,
                    relative_path: row.get(1)?,
                    status: row.get(2)?,
                    error_message: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    // ── Job runs ─────────────────────────────────────────────────

    pub fn start_job_run(&self, tool: &str, command: &str, options_json: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_runs (tool, command, options_json, started_at, status) \
                 VALUES (?1, ?2, ?3, ?4, 'running')",
                params![tool, command, options_json, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn complete_job_run(&self, run_id: i64, status: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE job_runs SET completed_at = ?1, status = ?2 WHERE id = ?3",
                params![now, status, run_id],
            )
        })?;
        Ok(())
    }

    pub fn list_job_runs(&self) -> Result<Vec<JobRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tool, command, options_json, started_at, completed_at, status \
                 FROM job_runs ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(JobRun {
                    id: row.get(0)?,
                    tool: row.get(1)?,
                    command: row.get(2)?,
                    options_json: row.get(3)?,
                    started_at: row.get(4)?,
                    completed_at: row.get(5)?,
                    status: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }
}
