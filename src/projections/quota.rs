//! The `quotas` and `quota_periods` read models.
//!
//! `quotas` mirrors the quota events. `quota_periods` holds the usage count
//! of each period; it is written by [`increment_usage`], not by events, and
//! is cleared when the quota is removed.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Deserialize;

use crate::domain::INSTANCE_AGGREGATE_TYPE;
use crate::domain::quota::{Quota, QuotaUnit};
use crate::event::Event;
use crate::executor::{ExecutorError, ProjectionDb};
use crate::projection::{AggregateReducer, EventReducer, Projection, ReduceError, decode_payload};
use crate::sqlite::{from_sql_int, to_millis, to_sql_int};
use crate::statement::{Column, Statement};

use super::instance_column;

/// Table names.
pub const QUOTAS_TABLE: &str = "quotas";
pub const QUOTA_PERIODS_TABLE: &str = "quota_periods";

/// Column names.
pub const UNIT: &str = "unit";
pub const AMOUNT: &str = "amount";
pub const FROM_MS: &str = "from_ms";
pub const INTERVAL_MS: &str = "interval_ms";
pub const LIMIT_USAGE: &str = "limit_usage";
pub const CHANGE_DATE: &str = "change_date";
pub const SEQUENCE: &str = "sequence";

/// Event types handled.
pub const QUOTA_ADDED: &str = "quota.added";
pub const QUOTA_REMOVED: &str = "quota.removed";

/// Projection of quotas and their usage periods.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaProjection;

impl Projection for QuotaProjection {
    const NAME: &'static str = "projections.quotas";

    const SCHEMA: &'static str = r"
CREATE TABLE IF NOT EXISTS quotas (
    instance_id TEXT    NOT NULL,
    unit        TEXT    NOT NULL,
    amount      INTEGER NOT NULL,
    from_ms     INTEGER NOT NULL,
    interval_ms INTEGER NOT NULL,
    limit_usage INTEGER NOT NULL,
    change_date INTEGER NOT NULL,
    sequence    INTEGER NOT NULL,
    PRIMARY KEY (instance_id, unit)
);

CREATE TABLE IF NOT EXISTS quota_periods (
    instance_id TEXT    NOT NULL,
    unit        TEXT    NOT NULL,
    start_ms    INTEGER NOT NULL,
    usage       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (instance_id, unit, start_ms)
);
";

    fn reducers() -> Vec<AggregateReducer> {
        vec![AggregateReducer {
            aggregate_type: INSTANCE_AGGREGATE_TYPE,
            event_reducers: vec![
                EventReducer {
                    event_type: QUOTA_ADDED,
                    reduce: reduce_quota_added,
                },
                EventReducer {
                    event_type: QUOTA_REMOVED,
                    reduce: reduce_quota_removed,
                },
            ],
        }]
    }
}

fn key(event: &Event, unit: QuotaUnit) -> Vec<Column> {
    vec![
        instance_column(&event.instance_id),
        Column::new(UNIT, unit.as_str()),
    ]
}

fn reduce_quota_added(event: &Event) -> Result<Vec<Statement>, ReduceError> {
    let quota: Quota = decode_payload(event)?;
    Ok(vec![Statement::Upsert {
        table: QUOTAS_TABLE,
        key: key(event, quota.unit),
        columns: vec![
            Column::new(AMOUNT, quota.amount),
            Column::new(FROM_MS, to_millis(quota.from)),
            Column::new(INTERVAL_MS, quota.interval_millis()),
            Column::new(LIMIT_USAGE, quota.limit),
            Column::new(CHANGE_DATE, event.creation_date),
            Column::new(SEQUENCE, event.sequence),
        ],
    }])
}

#[derive(Deserialize)]
struct RemovedPayload {
    unit: QuotaUnit,
}

/// Removing a quota drops its definition and every usage period.
fn reduce_quota_removed(event: &Event) -> Result<Vec<Statement>, ReduceError> {
    let removed: RemovedPayload = decode_payload(event)?;
    Ok(vec![
        Statement::Delete {
            table: QUOTAS_TABLE,
            key: key(event, removed.unit),
        },
        Statement::Delete {
            table: QUOTA_PERIODS_TABLE,
            key: key(event, removed.unit),
        },
    ])
}

/// Add `count` to the usage of the period of `unit` starting at
/// `period_start`, creating the period row on first use.
///
/// # Returns
///
/// The period's usage after the increment.
///
/// # Errors
///
/// Returns [`ExecutorError::Database`] on database failure.
pub async fn increment_usage(
    db: &ProjectionDb,
    instance_id: &str,
    unit: QuotaUnit,
    period_start: DateTime<Utc>,
    count: u64,
) -> Result<u64, ExecutorError> {
    let instance_id = instance_id.to_string();
    let usage = db
        .transaction(move |tx| -> Result<i64, ExecutorError> {
            Ok(tx.query_row(
                "INSERT INTO quota_periods (instance_id, unit, start_ms, usage)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (instance_id, unit, start_ms) DO UPDATE SET
                     usage = usage + excluded.usage
                 RETURNING usage",
                params![
                    instance_id,
                    unit.as_str(),
                    to_millis(period_start),
                    to_sql_int(count)
                ],
                |row| row.get(0),
            )?)
        })
        .await?;
    tracing::debug!(unit = %unit, usage, "quota usage incremented");
    Ok(from_sql_int(usage))
}
