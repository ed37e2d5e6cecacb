//! Shared `SQLite` connection handle used by the event store and the
//! projection database.
//!
//! A single [`Connection`] sits behind a mutex. Every call runs on tokio's
//! blocking pool so that async callers never stall the runtime on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};

/// Errors raised by the connection handle itself, independent of the
/// statement being run.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error reported by `SQLite`.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A previous holder of the connection panicked.
    #[error("database connection mutex poisoned")]
    Poisoned,

    /// The blocking task running the closure did not complete.
    #[error("database task failed: {0}")]
    TaskFailed(String),
}

/// Cloneable handle to one `SQLite` connection.
///
/// `Clone` is cheap: the connection is `Arc`-wrapped.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) a database file and run `schema` against it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the file cannot be opened or the
    /// schema fails to apply.
    pub fn open(path: impl AsRef<Path>, schema: &str) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(schema)?;
        Ok(Self::from_connection(conn))
    }

    /// Create a private in-memory database and run `schema` against it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the schema fails to apply.
    pub fn in_memory(schema: &str) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection on the blocking pool.
    ///
    /// Dropping the returned future does not interrupt `f`; a transaction
    /// opened inside it either commits or rolls back as a whole.
    pub(crate) async fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| E::from(DbError::Poisoned))?;
            f(&mut guard)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => Err(E::from(DbError::TaskFailed(e.to_string()))),
        }
    }
}

// SQLite stores integers as i64. Sequences and versions never come close to
// i64::MAX, so saturating conversions are enough at the boundary.

pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Current time truncated to the millisecond precision stored on disk, so
/// values read back compare equal to the values written.
pub(crate) fn now_millis() -> DateTime<Utc> {
    from_millis(to_millis(Utc::now()))
}
