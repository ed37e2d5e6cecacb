//! Read-side queries over the projection tables.
//!
//! Absence is not an error here: a query that finds no row returns
//! `Ok(None)`.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::domain::features::{Features, FeaturesState};
use crate::domain::quota::QuotaUnit;
use crate::executor::ProjectionDb;
use crate::sqlite::{DbError, from_sql_int, to_millis};

/// Errors from read-side queries.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The projection database failed.
    #[error("query failed: {0}")]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for QueryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DbError::Sqlite(e))
    }
}

const SELECT_FEATURES: &str = "SELECT tier_name, tier_description, state, state_description,
        audit_log_retention_secs, login_policy_factors, login_policy_idp,
        login_policy_passwordless, login_policy_registration, login_policy_username_login,
        login_policy_password_reset, password_complexity_policy, label_policy_private_label,
        label_policy_watermark, custom_domain, privacy_policy, metadata_user,
        custom_text_message, custom_text_login, lockout_policy, actions
    FROM features
    WHERE instance_id = ?1 AND aggregate_id = ?2 AND is_default = ?3";

fn row_to_features(row: &rusqlite::Row<'_>) -> rusqlite::Result<Features> {
    Ok(Features {
        tier_name: row.get(0)?,
        tier_description: row.get(1)?,
        state: FeaturesState::from_code(row.get(2)?),
        state_description: row.get(3)?,
        audit_log_retention_secs: from_sql_int(row.get(4)?),
        login_policy_factors: row.get(5)?,
        login_policy_idp: row.get(6)?,
        login_policy_passwordless: row.get(7)?,
        login_policy_registration: row.get(8)?,
        login_policy_username_login: row.get(9)?,
        login_policy_password_reset: row.get(10)?,
        password_complexity_policy: row.get(11)?,
        label_policy_private_label: row.get(12)?,
        label_policy_watermark: row.get(13)?,
        custom_domain: row.get(14)?,
        privacy_policy: row.get(15)?,
        metadata_user: row.get(16)?,
        custom_text_message: row.get(17)?,
        custom_text_login: row.get(18)?,
        lockout_policy: row.get(19)?,
        actions: row.get(20)?,
    })
}

/// Read-only accessors over the projection database.
///
/// Queries see what the projections have applied so far; they lag the
/// event store until the projections catch up.
#[derive(Debug, Clone)]
pub struct Queries {
    db: ProjectionDb,
}

impl Queries {
    /// Create queries over `db`.
    pub fn new(db: ProjectionDb) -> Self {
        Self { db }
    }

    /// Remaining units of `unit` in the current period, or `None` when no
    /// enforced quota has a period covering now.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on database failure; absence is `Ok(None)`.
    pub async fn remaining_quota_usage(
        &self,
        instance_id: &str,
        unit: QuotaUnit,
    ) -> Result<Option<u64>, QueryError> {
        self.remaining_quota_usage_at(instance_id, unit, Utc::now())
            .await
    }

    /// [`remaining_quota_usage`](Self::remaining_quota_usage) evaluated at
    /// `now`.
    ///
    /// A period qualifies when its quota enforces the limit, it started
    /// before `now`, and less than one interval has passed since its start.
    /// The result is `max(0, amount - usage)`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on database failure; absence is `Ok(None)`.
    pub async fn remaining_quota_usage_at(
        &self,
        instance_id: &str,
        unit: QuotaUnit,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, QueryError> {
        let instance_id = instance_id.to_string();
        let now = to_millis(now);
        let remaining = self
            .db
            .read(move |conn| -> Result<Option<i64>, QueryError> {
                Ok(conn
                    .query_row(
                        "SELECT MAX(0, q.amount - p.usage)
                         FROM quota_periods p
                         JOIN quotas q ON q.instance_id = p.instance_id AND q.unit = p.unit
                         WHERE p.instance_id = ?1
                           AND p.unit = ?2
                           AND q.limit_usage = 1
                           AND p.start_ms < ?3
                           AND ?3 - p.start_ms < q.interval_ms
                         ORDER BY p.start_ms DESC
                         LIMIT 1",
                        params![instance_id, unit.as_str(), now],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(remaining.map(from_sql_int))
    }

    /// The feature overrides of `org_id`, if set.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on database failure; absence is `Ok(None)`.
    pub async fn org_features(
        &self,
        instance_id: &str,
        org_id: &str,
    ) -> Result<Option<Features>, QueryError> {
        self.features(instance_id, org_id, false).await
    }

    /// The instance default feature set, if set.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on database failure; absence is `Ok(None)`.
    pub async fn default_features(
        &self,
        instance_id: &str,
    ) -> Result<Option<Features>, QueryError> {
        self.features(instance_id, instance_id, true).await
    }

    async fn features(
        &self,
        instance_id: &str,
        aggregate_id: &str,
        is_default: bool,
    ) -> Result<Option<Features>, QueryError> {
        let instance_id = instance_id.to_string();
        let aggregate_id = aggregate_id.to_string();
        self.db
            .read(move |conn| -> Result<Option<Features>, QueryError> {
                Ok(conn
                    .query_row(
                        SELECT_FEATURES,
                        params![instance_id, aggregate_id, is_default],
                        row_to_features,
                    )
                    .optional()?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::quota::Quota;
    use crate::executor::execute_statements;
    use crate::projection::Projection;
    use crate::projections::features::FeaturesProjection;
    use crate::projections::quota::{QuotaProjection, increment_usage};
    use crate::statement::{Column, Statement};

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("timestamp")
    }

    async fn db() -> ProjectionDb {
        let db = ProjectionDb::in_memory().expect("db");
        db.init_schema(QuotaProjection::SCHEMA)
            .await
            .expect("quota schema");
        db.init_schema(FeaturesProjection::SCHEMA)
            .await
            .expect("features schema");
        db
    }

    async fn insert_quota(db: &ProjectionDb, quota: &Quota) {
        let stmt = Statement::Upsert {
            table: "quotas",
            key: vec![
                Column::new("instance_id", "inst-1"),
                Column::new("unit", quota.unit.as_str()),
            ],
            columns: vec![
                Column::new("amount", quota.amount),
                Column::new("from_ms", to_millis(quota.from)),
                Column::new("interval_ms", quota.interval_millis()),
                Column::new("limit_usage", quota.limit),
                Column::new("change_date", quota.from),
                Column::new("sequence", 1u64),
            ],
        };
        db.transaction(move |tx| execute_statements(tx, &[stmt]))
            .await
            .expect("insert quota");
    }

    fn quota(limit: bool) -> Quota {
        Quota {
            unit: QuotaUnit::RequestsAllAuthenticated,
            from: at(0),
            interval: Duration::from_secs(60),
            amount: 10,
            limit,
        }
    }

    #[tokio::test]
    async fn remaining_is_amount_minus_usage_within_the_window() {
        let db = db().await;
        let queries = Queries::new(db.clone());
        let q = quota(true);
        insert_quota(&db, &q).await;
        increment_usage(&db, "inst-1", q.unit, q.period_start(at(30_000)), 4)
            .await
            .expect("usage");

        assert_eq!(
            queries
                .remaining_quota_usage_at("inst-1", q.unit, at(30_000))
                .await
                .expect("query"),
            Some(6)
        );
    }

    #[tokio::test]
    async fn remaining_never_goes_below_zero() {
        let db = db().await;
        let queries = Queries::new(db.clone());
        let q = quota(true);
        insert_quota(&db, &q).await;
        increment_usage(&db, "inst-1", q.unit, at(0), 25)
            .await
            .expect("usage");

        assert_eq!(
            queries
                .remaining_quota_usage_at("inst-1", q.unit, at(1_000))
                .await
                .expect("query"),
            Some(0)
        );
    }

    #[tokio::test]
    async fn absent_or_inactive_period_is_none_without_error() {
        let db = db().await;
        let queries = Queries::new(db.clone());
        let unit = QuotaUnit::RequestsAllAuthenticated;

        // No quota at all.
        assert_eq!(
            queries
                .remaining_quota_usage("inst-1", unit)
                .await
                .expect("query"),
            None
        );

        // A period that has already ended.
        let q = quota(true);
        insert_quota(&db, &q).await;
        increment_usage(&db, "inst-1", unit, at(0), 1)
            .await
            .expect("usage");
        assert_eq!(
            queries
                .remaining_quota_usage_at("inst-1", unit, at(60_000))
                .await
                .expect("query"),
            None
        );

        // Another instance never sees this quota.
        assert_eq!(
            queries
                .remaining_quota_usage_at("inst-2", unit, at(1_000))
                .await
                .expect("query"),
            None
        );
    }

    #[tokio::test]
    async fn quota_without_limit_is_none() {
        let db = db().await;
        let queries = Queries::new(db.clone());
        let q = quota(false);
        insert_quota(&db, &q).await;
        increment_usage(&db, "inst-1", q.unit, at(0), 1)
            .await
            .expect("usage");
        assert_eq!(
            queries
                .remaining_quota_usage_at("inst-1", q.unit, at(1_000))
                .await
                .expect("query"),
            None
        );
    }

    #[tokio::test]
    async fn missing_features_are_none() {
        let queries = Queries::new(db().await);
        let org = queries.org_features("inst-1", "O1").await.expect("org");
        assert_eq!(org, None);
        let default = queries.default_features("inst-1").await.expect("default");
        assert_eq!(default, None);
    }
}
