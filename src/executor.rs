//! The statement executor and the projection database it runs against.

use std::path::Path;

use rusqlite::{Connection, Transaction, TransactionBehavior, params_from_iter};

use crate::sqlite::{Database, DbError};
use crate::statement::Statement;
use crate::tracker::TRACKER_SCHEMA;

/// Errors from the projection database.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// A statement cannot be executed as given.
    #[error("invalid statement on table {table}: {reason}")]
    InvalidStatement {
        /// Target table.
        table: &'static str,
        /// Why it was refused.
        reason: &'static str,
    },

    /// The database failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DbError::Sqlite(e))
    }
}

/// Execute `statements` in order on `tx`.
///
/// # Returns
///
/// The total number of rows changed.
///
/// # Errors
///
/// * [`ExecutorError::InvalidStatement`] for a delete without key columns or
///   an upsert without key columns.
/// * [`ExecutorError::Database`] if `SQLite` rejects a statement. The caller
///   owns the transaction and decides whether to roll back.
pub fn execute_statements(
    tx: &Connection,
    statements: &[Statement],
) -> Result<usize, ExecutorError> {
    let mut changed = 0;
    for statement in statements {
        if statement.key().is_empty() {
            return Err(ExecutorError::InvalidStatement {
                table: statement.table(),
                reason: "statement has no key columns",
            });
        }
        let (sql, values) = statement.to_sql();
        changed += tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    }
    Ok(changed)
}

/// Handle to the database that holds read-model tables and projection
/// tracking state.
///
/// `Clone` is cheap; clones share the connection.
#[derive(Debug, Clone)]
pub struct ProjectionDb {
    db: Database,
}

impl ProjectionDb {
    /// Open (or create) the projection database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Database`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        Ok(Self {
            db: Database::open(path, TRACKER_SCHEMA)?,
        })
    }

    /// Create an in-memory projection database.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Database`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self, ExecutorError> {
        Ok(Self {
            db: Database::in_memory(TRACKER_SCHEMA)?,
        })
    }

    /// Apply idempotent DDL, typically a projection's table definitions.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Database`] if the DDL fails.
    pub async fn init_schema(&self, ddl: &'static str) -> Result<(), ExecutorError> {
        self.db
            .call(move |conn| -> Result<(), ExecutorError> {
                conn.execute_batch(ddl)?;
                Ok(())
            })
            .await
    }

    /// Run `f` inside one immediate transaction.
    ///
    /// The transaction commits iff `f` returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or a database error from begin/commit.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + From<rusqlite::Error> + Send + 'static,
    {
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .await
    }

    /// Run a read-only closure against the connection.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`.
    pub async fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        self.db.call(move |conn| f(conn)).await
    }
}
