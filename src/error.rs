//! Crate-level error types for the command pipeline and the event store.

use crate::eventstore::ExpectedVersion;
use crate::sqlite::DbError;

/// Error returned by a command.
///
/// Variants map one-to-one onto the kinds callers branch on. Only
/// [`ConcurrencyConflict`](CommandError::ConcurrencyConflict) is safe to
/// retry automatically; every other variant is final for the given input.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Malformed or missing request fields, detected before storage access.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A create-type command targets an aggregate that is already active.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A mutate-type command targets an aggregate that is not active.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested change would not alter the current state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Another writer appended to the aggregate since it was loaded.
    #[error(
        "optimistic concurrency conflict on {aggregate_type}/{aggregate_id}: \
         expected {expected}, found version {actual}"
    )]
    ConcurrencyConflict {
        /// Aggregate type of the contested aggregate.
        aggregate_type: String,
        /// Aggregate id of the contested aggregate.
        aggregate_id: String,
        /// The version the command was decided against.
        expected: ExpectedVersion,
        /// The version found at append time.
        actual: u64,
    },

    /// Codec, storage, or other infrastructure failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Whether reloading the write model and re-deciding may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Error returned by an [`EventStore`](crate::eventstore::EventStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The aggregate's version no longer matches the expected version.
    #[error(
        "optimistic concurrency conflict on {aggregate_type}/{aggregate_id}: \
         expected {expected}, found version {actual}"
    )]
    Conflict {
        /// Aggregate type of the contested aggregate.
        aggregate_type: String,
        /// Aggregate id of the contested aggregate.
        aggregate_id: String,
        /// Version the caller expected.
        expected: ExpectedVersion,
        /// Version currently stored.
        actual: u64,
    },

    /// The request cannot be stored as given (e.g. empty identity fields).
    #[error("invalid event: {0}")]
    Invalid(String),

    /// A payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The underlying database failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DbError::Sqlite(e))
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict {
                aggregate_type,
                aggregate_id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                aggregate_type,
                aggregate_id,
                expected,
                actual,
            },
            StoreError::Invalid(msg) => Self::InvalidArgument(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflict_is_retryable() {
        let conflict = CommandError::ConcurrencyConflict {
            aggregate_type: "org".into(),
            aggregate_id: "o-1".into(),
            expected: ExpectedVersion::Exact(2),
            actual: 3,
        };
        assert!(conflict.is_retryable());
        assert!(!CommandError::NotFound("x".into()).is_retryable());
        assert!(!CommandError::AlreadyExists("x".into()).is_retryable());
        assert!(!CommandError::PreconditionFailed("x".into()).is_retryable());
        assert!(!CommandError::Internal("x".into()).is_retryable());
        assert!(!CommandError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn store_conflict_maps_to_concurrency_conflict() {
        let err: CommandError = StoreError::Conflict {
            aggregate_type: "org".into(),
            aggregate_id: "o-1".into(),
            expected: ExpectedVersion::NoStream,
            actual: 1,
        }
        .into();
        assert!(matches!(err, CommandError::ConcurrencyConflict { actual: 1, .. }));
        assert!(err.to_string().contains("org/o-1"));
    }

    #[test]
    fn database_errors_map_to_internal() {
        let err: CommandError = StoreError::Database(DbError::Poisoned).into();
        assert!(matches!(err, CommandError::Internal(_)));
    }

    #[test]
    fn conflict_display_names_versions() {
        let err = StoreError::Conflict {
            aggregate_type: "org".into(),
            aggregate_id: "o-1".into(),
            expected: ExpectedVersion::Exact(4),
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "optimistic concurrency conflict on org/o-1: expected version 4, found version 5"
        );
    }

    // Errors cross task boundaries through `spawn_blocking` and tokio
    // channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<CommandError>();
            assert_send_sync::<StoreError>();
        }
    };
}
