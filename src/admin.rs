//! Administration of projection progress and failed events.

use crate::executor::ProjectionDb;
use crate::sqlite::DbError;
use crate::tracker::{self, FailedEvent, ProjectionState, TrackerError};

/// Errors from administrative operations.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// No failed event matches the request.
    #[error(
        "failed event {sequence} of projection {projection} on instance {instance_id} not found"
    )]
    NotFound {
        /// Projection name.
        projection: String,
        /// Instance id.
        instance_id: String,
        /// Failed sequence.
        sequence: u64,
    },

    /// The tracker tables could not be read or written.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The projection database failed.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<rusqlite::Error> for AdminError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Tracker(TrackerError::Database(e))
    }
}

/// Inspect and clean up projection failures.
#[derive(Debug, Clone)]
pub struct Admin {
    db: ProjectionDb,
}

impl Admin {
    /// Create an admin handle over `db`.
    pub fn new(db: ProjectionDb) -> Self {
        Self { db }
    }

    /// Failed events of `instance_id`, optionally of one projection.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError`] on database failure.
    pub async fn failed_events(
        &self,
        instance_id: &str,
        projection: Option<&str>,
    ) -> Result<Vec<FailedEvent>, AdminError> {
        let instance_id = instance_id.to_string();
        let projection = projection.map(str::to_string);
        self.db
            .read(move |conn| -> Result<_, AdminError> {
                Ok(tracker::failed_events(conn, &instance_id, projection.as_deref())?)
            })
            .await
    }

    /// Delete one failed-event record.
    ///
    /// Removing the record of an event that is still being retried resets
    /// its failure count for the next attempt.
    ///
    /// # Errors
    ///
    /// * [`AdminError::NotFound`] if no such record exists.
    /// * [`AdminError::Tracker`] on database failure.
    pub async fn remove_failed_event(
        &self,
        projection: &str,
        instance_id: &str,
        sequence: u64,
    ) -> Result<(), AdminError> {
        let projection = projection.to_string();
        let instance_id = instance_id.to_string();
        let removed = self
            .db
            .transaction({
                let projection = projection.clone();
                let instance_id = instance_id.clone();
                move |conn| -> Result<bool, AdminError> {
                    Ok(tracker::clear_failure(conn, &projection, &instance_id, sequence)?)
                }
            })
            .await?;
        if !removed {
            return Err(AdminError::NotFound {
                projection,
                instance_id,
                sequence,
            });
        }
        tracing::info!(
            projection = %projection,
            instance_id = %instance_id,
            sequence,
            "failed event removed"
        );
        Ok(())
    }

    /// Progress of every projection on `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError`] on database failure.
    pub async fn projection_states(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ProjectionState>, AdminError> {
        let instance_id = instance_id.to_string();
        self.db
            .read(move |conn| -> Result<_, AdminError> {
                Ok(tracker::states(conn, &instance_id)?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::now_millis;

    async fn seeded() -> Admin {
        let db = ProjectionDb::in_memory().expect("db");
        db.transaction(|tx| -> Result<(), AdminError> {
            let now = now_millis();
            tracker::advance(tx, "projections.features", "inst-1", 4, now)?;
            tracker::record_failure(tx, "projections.features", "inst-1", 5, "boom", now)?;
            tracker::record_failure(tx, "projections.quotas", "inst-1", 7, "bad", now)?;
            Ok(())
        })
        .await
        .expect("seed");
        Admin::new(db)
    }

    #[tokio::test]
    async fn lists_failed_events_per_projection() {
        let admin = seeded().await;
        let all = admin.failed_events("inst-1", None).await.expect("all");
        assert_eq!(all.len(), 2);
        let features = admin
            .failed_events("inst-1", Some("projections.features"))
            .await
            .expect("features");
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].failed_sequence, 5);
        assert_eq!(features[0].failure_count, 1);
        assert_eq!(features[0].error, "boom");
    }

    #[tokio::test]
    async fn remove_failed_event_then_not_found() {
        let admin = seeded().await;
        admin
            .remove_failed_event("projections.features", "inst-1", 5)
            .await
            .expect("remove");
        let err = admin
            .remove_failed_event("projections.features", "inst-1", 5)
            .await
            .expect_err("gone");
        assert!(matches!(err, AdminError::NotFound { sequence: 5, .. }));
        let all = admin.failed_events("inst-1", None).await.expect("all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn projection_states_report_progress() {
        let admin = seeded().await;
        let states = admin.projection_states("inst-1").await.expect("states");
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].projection, "projections.features");
        assert_eq!(states[0].current_sequence, 4);
        assert_eq!(states[0].last_failed_sequence, Some(5));
        assert!(
            admin
                .projection_states("inst-2")
                .await
                .expect("none")
                .is_empty()
        );
    }
}
