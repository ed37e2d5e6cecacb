//! Per-(projection, instance) sequence tracking and failed-event records.
//!
//! These functions take a plain connection so the projection runner can
//! call them on the same transaction that executes its statements. The
//! sequence advance and the read-model writes then commit or roll back
//! together.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::sqlite::{from_millis, from_sql_int, to_millis, to_sql_int};

/// Tables owned by the tracker. Idempotent.
pub(crate) const TRACKER_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS projection_states (
    projection           TEXT    NOT NULL,
    instance_id          TEXT    NOT NULL,
    current_sequence     INTEGER NOT NULL DEFAULT 0,
    last_successful_run  INTEGER,
    last_failed_sequence INTEGER,
    failure_count        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (projection, instance_id)
);

CREATE TABLE IF NOT EXISTS failed_events (
    projection      TEXT    NOT NULL,
    instance_id     TEXT    NOT NULL,
    failed_sequence INTEGER NOT NULL,
    failure_count   INTEGER NOT NULL,
    error           TEXT    NOT NULL,
    last_failed     INTEGER NOT NULL,
    skipped         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (projection, instance_id, failed_sequence)
);
";

/// Errors from the tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// An advance would move the sequence backwards.
    #[error(
        "projection {projection} on instance {instance_id}: \
         cannot move sequence from {current} back to {requested}"
    )]
    Regression {
        /// Projection name.
        projection: String,
        /// Instance id.
        instance_id: String,
        /// Stored sequence.
        current: u64,
        /// Requested sequence.
        requested: u64,
    },

    /// The database failed.
    #[error("tracker database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Progress of one projection on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Projection name.
    pub projection: String,
    /// Instance id.
    pub instance_id: String,
    /// Sequence of the last event applied (or skipped).
    pub current_sequence: u64,
    /// When the sequence last advanced.
    pub last_successful_run: Option<DateTime<Utc>>,
    /// Sequence of the event currently failing, if any.
    pub last_failed_sequence: Option<u64>,
    /// Consecutive failures of `last_failed_sequence`.
    pub failure_count: u32,
}

/// An event a projection could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    /// Projection name.
    pub projection: String,
    /// Instance id.
    pub instance_id: String,
    /// Sequence of the failing event.
    pub failed_sequence: u64,
    /// How often it failed.
    pub failure_count: u32,
    /// Last error message.
    pub error: String,
    /// When it last failed.
    pub last_failed: DateTime<Utc>,
    /// Whether the projection gave up and moved past it.
    pub skipped: bool,
}

fn count(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectionState> {
    Ok(ProjectionState {
        projection: row.get(0)?,
        instance_id: row.get(1)?,
        current_sequence: from_sql_int(row.get(2)?),
        last_successful_run: row.get::<_, Option<i64>>(3)?.map(from_millis),
        last_failed_sequence: row.get::<_, Option<i64>>(4)?.map(from_sql_int),
        failure_count: count(row.get(5)?),
    })
}

fn row_to_failed(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedEvent> {
    Ok(FailedEvent {
        projection: row.get(0)?,
        instance_id: row.get(1)?,
        failed_sequence: from_sql_int(row.get(2)?),
        failure_count: count(row.get(3)?),
        error: row.get(4)?,
        last_failed: from_millis(row.get(5)?),
        skipped: row.get(6)?,
    })
}

/// Read the state row, if the projection ever ran on the instance.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn get(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
) -> Result<Option<ProjectionState>, TrackerError> {
    Ok(conn
        .query_row(
            "SELECT projection, instance_id, current_sequence, last_successful_run,
                    last_failed_sequence, failure_count
             FROM projection_states WHERE projection = ?1 AND instance_id = ?2",
            params![projection, instance_id],
            row_to_state,
        )
        .optional()?)
}

/// The last applied sequence, or 0.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn current_sequence(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
) -> Result<u64, TrackerError> {
    Ok(get(conn, projection, instance_id)?.map_or(0, |s| s.current_sequence))
}

/// Move the sequence forward to `to`.
///
/// Advancing to the current value is allowed and refreshes
/// `last_successful_run`. Once `to` reaches the failing sequence, the
/// state's failure columns are reset.
///
/// # Errors
///
/// * [`TrackerError::Regression`] if `to` is below the stored sequence.
/// * [`TrackerError::Database`] on query failure.
pub fn advance(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    to: u64,
    now: DateTime<Utc>,
) -> Result<(), TrackerError> {
    let current = current_sequence(conn, projection, instance_id)?;
    if to < current {
        return Err(TrackerError::Regression {
            projection: projection.to_string(),
            instance_id: instance_id.to_string(),
            current,
            requested: to,
        });
    }
    conn.execute(
        "INSERT INTO projection_states
             (projection, instance_id, current_sequence, last_successful_run)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (projection, instance_id) DO UPDATE SET
             current_sequence = excluded.current_sequence,
             last_successful_run = excluded.last_successful_run,
             failure_count = CASE
                 WHEN last_failed_sequence <= excluded.current_sequence THEN 0
                 ELSE failure_count END,
             last_failed_sequence = CASE
                 WHEN last_failed_sequence <= excluded.current_sequence THEN NULL
                 ELSE last_failed_sequence END",
        params![projection, instance_id, to_sql_int(to), to_millis(now)],
    )?;
    Ok(())
}

/// Record one more failure of the event at `sequence`.
///
/// Updates both the failed-event row and the state's failure columns.
///
/// # Returns
///
/// The failure count of the event after this failure.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn record_failure(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    sequence: u64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u32, TrackerError> {
    let failures: i64 = conn.query_row(
        "INSERT INTO failed_events
             (projection, instance_id, failed_sequence, failure_count, error, last_failed)
         VALUES (?1, ?2, ?3, 1, ?4, ?5)
         ON CONFLICT (projection, instance_id, failed_sequence) DO UPDATE SET
             failure_count = failure_count + 1,
             error = excluded.error,
             last_failed = excluded.last_failed
         RETURNING failure_count",
        params![
            projection,
            instance_id,
            to_sql_int(sequence),
            error,
            to_millis(now),
        ],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO projection_states
             (projection, instance_id, current_sequence, last_failed_sequence, failure_count)
         VALUES (?1, ?2, 0, ?3, ?4)
         ON CONFLICT (projection, instance_id) DO UPDATE SET
             last_failed_sequence = excluded.last_failed_sequence,
             failure_count = excluded.failure_count",
        params![projection, instance_id, to_sql_int(sequence), failures],
    )?;
    Ok(count(failures))
}

/// Flag the failed event at `sequence` as skipped.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn mark_skipped(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    sequence: u64,
) -> Result<(), TrackerError> {
    conn.execute(
        "UPDATE failed_events SET skipped = 1
         WHERE projection = ?1 AND instance_id = ?2 AND failed_sequence = ?3",
        params![projection, instance_id, to_sql_int(sequence)],
    )?;
    Ok(())
}

/// Delete the failed-event record at `sequence`.
///
/// # Returns
///
/// `true` if a record was deleted.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn clear_failure(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    sequence: u64,
) -> Result<bool, TrackerError> {
    let deleted = conn.execute(
        "DELETE FROM failed_events
         WHERE projection = ?1 AND instance_id = ?2 AND failed_sequence = ?3",
        params![projection, instance_id, to_sql_int(sequence)],
    )?;
    Ok(deleted > 0)
}

/// Failed events of `instance_id`, optionally restricted to one projection,
/// ordered by projection and sequence.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn failed_events(
    conn: &Connection,
    instance_id: &str,
    projection: Option<&str>,
) -> Result<Vec<FailedEvent>, TrackerError> {
    let mut stmt = conn.prepare(
        "SELECT projection, instance_id, failed_sequence, failure_count, error, last_failed, skipped
         FROM failed_events
         WHERE instance_id = ?1 AND (?2 IS NULL OR projection = ?2)
         ORDER BY projection, failed_sequence",
    )?;
    let rows = stmt.query_map(params![instance_id, projection], row_to_failed)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Every projection state of `instance_id`, ordered by projection name.
///
/// # Errors
///
/// Returns [`TrackerError::Database`] on query failure.
pub fn states(conn: &Connection, instance_id: &str) -> Result<Vec<ProjectionState>, TrackerError> {
    let mut stmt = conn.prepare(
        "SELECT projection, instance_id, current_sequence, last_successful_run,
                last_failed_sequence, failure_count
         FROM projection_states WHERE instance_id = ?1 ORDER BY projection",
    )?;
    let rows = stmt.query_map(params![instance_id], row_to_state)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::now_millis;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(TRACKER_SCHEMA).expect("schema");
        conn
    }

    #[test]
    fn unknown_projection_starts_at_zero() {
        let conn = conn();
        assert_eq!(get(&conn, "p", "i").expect("get"), None);
        assert_eq!(current_sequence(&conn, "p", "i").expect("current"), 0);
    }

    #[test]
    fn advance_is_monotonic() {
        let conn = conn();
        advance(&conn, "p", "i", 5, now_millis()).expect("advance to 5");
        advance(&conn, "p", "i", 5, now_millis()).expect("same value is allowed");
        let err = advance(&conn, "p", "i", 4, now_millis()).expect_err("regression");
        assert!(matches!(
            err,
            TrackerError::Regression {
                current: 5,
                requested: 4,
                ..
            }
        ));

        let state = get(&conn, "p", "i").expect("get").expect("row");
        assert_eq!(state.current_sequence, 5);
        assert!(state.last_successful_run.is_some());
        assert_eq!(current_sequence(&conn, "p", "other").expect("other"), 0);
    }

    #[test]
    fn failures_count_up_and_reset_once_passed() {
        let conn = conn();
        advance(&conn, "p", "i", 2, now_millis()).expect("advance");
        assert_eq!(
            record_failure(&conn, "p", "i", 3, "boom", now_millis()).expect("fail"),
            1
        );
        assert_eq!(
            record_failure(&conn, "p", "i", 3, "boom again", now_millis()).expect("fail"),
            2
        );

        let state = get(&conn, "p", "i").expect("get").expect("row");
        assert_eq!(state.current_sequence, 2);
        assert_eq!(state.last_failed_sequence, Some(3));
        assert_eq!(state.failure_count, 2);

        let failed = failed_events(&conn, "i", None).expect("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "boom again");
        assert!(!failed[0].skipped);

        // Advancing short of the failing event keeps the failure.
        advance(&conn, "p", "i", 2, now_millis()).expect("advance");
        let row = get(&conn, "p", "i").expect("get").expect("row");
        assert_eq!(row.failure_count, 2);

        advance(&conn, "p", "i", 3, now_millis()).expect("advance past");
        let state = get(&conn, "p", "i").expect("get").expect("row");
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.last_failed_sequence, None);
    }

    #[test]
    fn skip_and_clear_failed_events() {
        let conn = conn();
        record_failure(&conn, "p", "i", 7, "bad payload", now_millis()).expect("fail");
        record_failure(&conn, "q", "i", 9, "bad payload", now_millis()).expect("fail");
        mark_skipped(&conn, "p", "i", 7).expect("skip");

        let only_p = failed_events(&conn, "i", Some("p")).expect("failed");
        assert_eq!(only_p.len(), 1);
        assert!(only_p[0].skipped);
        assert_eq!(failed_events(&conn, "i", None).expect("all").len(), 2);
        assert!(failed_events(&conn, "other", None).expect("other").is_empty());

        assert!(clear_failure(&conn, "p", "i", 7).expect("clear"));
        assert!(!clear_failure(&conn, "p", "i", 7).expect("clear again"));
    }

    #[test]
    fn states_lists_every_projection_of_an_instance() {
        let conn = conn();
        advance(&conn, "b", "i", 1, now_millis()).expect("advance");
        advance(&conn, "a", "i", 2, now_millis()).expect("advance");
        advance(&conn, "a", "j", 3, now_millis()).expect("advance");
        let names: Vec<_> = states(&conn, "i")
            .expect("states")
            .into_iter()
            .map(|s| s.projection)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
