use rusqlite::{params, Connection, ErrorCode, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Schema name the checksum-cache store is attached under.
pub const CACHE_SCHEMA: &str = "checksumdb";

/// Bounded retry applied around every database operation when SQLite
/// reports the store as busy or locked.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 8,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.min(10))
    }
}

enum Backend {
    Shared(Mutex<Connection>),
    PerCall { db_path: PathBuf, cache_path: PathBuf },
}

/// The job store with the checksum cache attached as [`CACHE_SCHEMA`].
///
/// `open` shares one connection between all callers; `open_per_call` opens a
/// fresh connection for every operation so worker threads only contend inside
/// SQLite. Both go through [`Database::with_conn`].
pub struct Database {
    backend: Backend,
    retry: RetryPolicy,
}

impl Database {
    pub fn open(db_path: &Path, cache_path: &Path) -> Result<Self> {
        let conn = open_connection(db_path, cache_path)?;
        let db = Database {
            backend: Backend::Shared(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn open_per_call(db_path: &Path, cache_path: &Path) -> Result<Self> {
        let db = Database {
            backend: Backend::PerCall {
                db_path: db_path.to_path_buf(),
                cache_path: cache_path.to_path_buf(),
            },
            retry: RetryPolicy::default(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            &format!("ATTACH DATABASE ':memory:' AS {}", CACHE_SCHEMA),
            [],
        )?;
        let db = Database {
            backend: Backend::Shared(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Idempotent creation of every tool's tables plus the cache table.
    fn initialize_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(include_str!("schema.sql"))?;
            conn.execute_batch(include_str!("cache_schema.sql"))
        })?;
        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Run `f` against a connection, retrying with exponential backoff while
    /// the store is busy. `f` may run more than once, so it must not carry
    /// side effects outside the database.
    pub fn with_conn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let result = match &self.backend {
                Backend::Shared(conn) => f(&lock(conn)),
                Backend::PerCall {
                    db_path,
                    cache_path,
                } => open_connection(db_path, cache_path).and_then(|conn| f(&conn)),
            };
            match result {
                Err(e) if is_busy(&e) && attempt < self.retry.retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Database busy (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.retry.retries,
                        delay,
                        e
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Write the attached cache to a standalone store file.
    pub fn export_cache(&self, target: &Path) -> Result<()> {
        let tmp = target.with_extension("db.tmp");
        if tmp.exists() {
            std::fs::remove_file(&tmp).map_err(io_to_sqlite)?;
        }
        let literal = tmp.to_string_lossy().replace('\'', "''");
        self.with_conn(|conn| {
            conn.execute_batch(&format!("VACUUM {} INTO '{}'", CACHE_SCHEMA, literal))
        })?;
        std::fs::rename(&tmp, target).map_err(io_to_sqlite)?;
        debug!("Checksum cache exported to {}", target.display());
        Ok(())
    }
}

fn open_connection(db_path: &Path, cache_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_pragmas(&conn)?;
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {}", CACHE_SCHEMA),
        params![cache_path.to_string_lossy()],
    )?;
    conn.execute_batch(&format!("PRAGMA {}.journal_mode = WAL;", CACHE_SCHEMA))?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA busy_timeout = 5000;",
    )
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // A panic while holding the lock leaves no partial transaction behind:
    // uncommitted transactions roll back when dropped.
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn io_to_sqlite(e: std::io::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

/// Whether `schema` (an attached database name) has a table called `table`.
pub fn attached_table_exists(conn: &Connection, schema: &str, table: &str) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        schema
    );
    let count: i64 = conn.query_row(&sql, params![table], |row| row.get(0))?;
    Ok(count > 0)
}
