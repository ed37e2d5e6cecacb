//! Projections (read models) maintained from the event log.
//!
//! A projection is a name, the DDL of its tables, and a registry of pure
//! reducers keyed by `(aggregate_type, event_type)`. Each reducer turns one
//! committed event into [`Statement`]s. The [`ProjectionRunner`] feeds the
//! reducers from the event store and commits their statements together with
//! the projection's sequence advance, per instance.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::Instrument;

use crate::error::StoreError;
use crate::event::Event;
use crate::eventstore::{EventFilter, EventStore, collect_events};
use crate::executor::{ExecutorError, ProjectionDb, execute_statements};
use crate::sqlite::{DbError, now_millis};
use crate::statement::Statement;
use crate::tracker::{self, TrackerError};

/// A reducer: one committed event in, the statements it implies out.
///
/// Reducers are pure. Every statement they emit must be safe to apply
/// twice (upserts and deletes keyed by identity).
pub type ReduceFn = fn(&Event) -> Result<Vec<Statement>, ReduceError>;

/// Why a reducer could not handle an event.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// The payload does not match the event type's schema.
    #[error("cannot decode payload of {event_type}: {source}")]
    Payload {
        /// Event type that failed to decode.
        event_type: String,
        /// Decoder error.
        source: serde_json::Error,
    },

    /// The event decoded but implies no valid statement.
    #[error("cannot build statement: {0}")]
    Statement(String),
}

/// Decode an event payload for a reducer.
///
/// # Errors
///
/// Returns [`ReduceError::Payload`] if the payload does not match `T`.
pub fn decode_payload<T: DeserializeOwned>(event: &Event) -> Result<T, ReduceError> {
    event.payload_as().map_err(|source| ReduceError::Payload {
        event_type: event.event_type.clone(),
        source,
    })
}

/// Reducer for one event type.
#[derive(Debug, Clone, Copy)]
pub struct EventReducer {
    /// Event type handled.
    pub event_type: &'static str,
    /// The reducer.
    pub reduce: ReduceFn,
}

/// The reducers a projection registers for one aggregate type.
#[derive(Debug, Clone)]
pub struct AggregateReducer {
    /// Aggregate type handled.
    pub aggregate_type: &'static str,
    /// Reducers by event type.
    pub event_reducers: Vec<EventReducer>,
}

/// A read model derived from the event log.
///
/// # Contract
///
/// - [`SCHEMA`](Projection::SCHEMA) must be idempotent DDL
///   (`CREATE TABLE IF NOT EXISTS ...`).
/// - Reducers must be deterministic: the same event always yields the same
///   statements.
pub trait Projection: Send + Sync + 'static {
    /// Unique projection name, the key of its tracking state.
    const NAME: &'static str;

    /// DDL for the projection's tables.
    const SCHEMA: &'static str;

    /// The reducer registry.
    fn reducers() -> Vec<AggregateReducer>;
}

/// Lookup table of one projection's reducers.
#[derive(Debug, Clone)]
pub struct ReducerTable {
    name: &'static str,
    schema: &'static str,
    reducers: HashMap<&'static str, HashMap<&'static str, ReduceFn>>,
}

impl ReducerTable {
    /// Build the table for `P`.
    pub fn of<P: Projection>() -> Self {
        let mut reducers: HashMap<&'static str, HashMap<&'static str, ReduceFn>> = HashMap::new();
        for aggregate in P::reducers() {
            let by_event = reducers.entry(aggregate.aggregate_type).or_default();
            for er in aggregate.event_reducers {
                by_event.insert(er.event_type, er.reduce);
            }
        }
        Self {
            name: P::NAME,
            schema: P::SCHEMA,
            reducers,
        }
    }

    /// Projection name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Projection DDL.
    pub fn schema(&self) -> &'static str {
        self.schema
    }

    /// The reducer for `(aggregate_type, event_type)`, if registered.
    pub fn lookup(&self, aggregate_type: &str, event_type: &str) -> Option<ReduceFn> {
        self.reducers
            .get(aggregate_type)
            .and_then(|by_event| by_event.get(event_type))
            .copied()
    }

    /// Every registered aggregate type, sorted.
    pub fn aggregate_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.reducers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Every registered event type, sorted and deduplicated.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self
            .reducers
            .values()
            .flat_map(|by_event| by_event.keys().copied())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    fn filter(&self, batch_size: u64) -> EventFilter {
        EventFilter::new()
            .aggregate_types(self.aggregate_types())
            .event_types(self.event_types())
            .limit(batch_size)
    }
}

/// Tuning for projection cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionConfig {
    /// Maximum events fetched per cycle. Zero is treated as one.
    pub batch_size: u64,
    /// Failures of one event after which it is skipped.
    pub max_failure_count: u32,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_failure_count: 5,
        }
    }
}

/// Errors that abort a projection cycle without committing anything.
///
/// Reducer failures are not among them: those are recorded on the failed
/// events table and reported through [`CycleOutcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Reading the event store failed.
    #[error("event store error: {0}")]
    Store(#[from] StoreError),

    /// The tracker refused an update.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The projection database failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Another runner advanced the projection during this cycle.
    #[error(
        "projection {projection} on instance {instance_id} moved from {expected} to {found} \
         during the cycle"
    )]
    Moved {
        /// Projection name.
        projection: &'static str,
        /// Instance id.
        instance_id: String,
        /// Sequence the cycle started from.
        expected: u64,
        /// Sequence found at commit time.
        found: u64,
    },
}

impl From<DbError> for ProjectionError {
    fn from(e: DbError) -> Self {
        Self::Executor(ExecutorError::Database(e))
    }
}

impl From<rusqlite::Error> for ProjectionError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Executor(e.into())
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No new events.
    Idle,
    /// Every fetched event was applied or skipped.
    Committed,
    /// The event at `sequence` failed; events before it were committed.
    Failed {
        /// Sequence of the failing event.
        sequence: u64,
        /// Its failure count after this cycle.
        failure_count: u32,
    },
}

/// Summary of one [`ProjectionRunner::run_once`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Events read from the store.
    pub fetched: usize,
    /// Events whose statements were committed.
    pub applied: usize,
    /// Events passed over: no reducer registered, or failed too often.
    pub skipped: usize,
    /// The projection's sequence after the cycle.
    pub current_sequence: u64,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
}

/// Drives one projection over the event log.
///
/// Cheap to clone. Cycles for different instances are independent; cycles
/// for the same instance are serialized by the projection database and a
/// cycle that loses a race ends with [`ProjectionError::Moved`].
#[derive(Clone)]
pub struct ProjectionRunner {
    table: Arc<ReducerTable>,
    store: Arc<dyn EventStore>,
    db: ProjectionDb,
    config: ProjectionConfig,
}

impl std::fmt::Debug for ProjectionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRunner")
            .field("projection", &self.table.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One event's outcome after reduction, before commit.
enum Reduced {
    Statements(u64, Vec<Statement>),
    Unhandled(u64),
    Failed(u64, String),
}

impl ProjectionRunner {
    /// Create a runner for `table`.
    pub fn new(
        table: ReducerTable,
        store: Arc<dyn EventStore>,
        db: ProjectionDb,
        mut config: ProjectionConfig,
    ) -> Self {
        // LIMIT 0 would never fetch anything.
        config.batch_size = config.batch_size.max(1);
        Self {
            table: Arc::new(table),
            store,
            db,
            config,
        }
    }

    /// Projection name.
    pub fn name(&self) -> &'static str {
        self.table.name()
    }

    /// Cycle tuning.
    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Create the projection's tables.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Executor`] if the DDL fails.
    pub async fn init(&self) -> Result<(), ProjectionError> {
        self.db.init_schema(self.table.schema()).await?;
        Ok(())
    }

    /// The projection's current sequence on `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Tracker`] on database failure.
    pub async fn current_sequence(&self, instance_id: &str) -> Result<u64, ProjectionError> {
        let name = self.name();
        let instance = instance_id.to_string();
        self.db
            .read(move |conn| -> Result<u64, ProjectionError> {
                Ok(tracker::current_sequence(conn, name, &instance)?)
            })
            .await
    }

    /// Run one cycle on `instance_id`: fetch up to `batch_size` new events,
    /// reduce them, and commit the statements with the sequence advance in
    /// one transaction.
    ///
    /// A reducer or statement failure commits everything before the
    /// failing event and records the failure in the same transaction. Once
    /// an event has failed `max_failure_count` times it is marked skipped
    /// and the sequence moves past it.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] for store, tracker, or database failures
    /// and for concurrent advances. Nothing is committed in that case.
    pub async fn run_once(&self, instance_id: &str) -> Result<CycleReport, ProjectionError> {
        let span = tracing::info_span!("projection_cycle", projection = self.name(), instance_id);
        self.cycle(instance_id).instrument(span).await
    }

    async fn cycle(&self, instance_id: &str) -> Result<CycleReport, ProjectionError> {
        let start = self.current_sequence(instance_id).await?;
        let filter = self.table.filter(self.config.batch_size);
        let stream = self.store.subscribe(instance_id, start, filter).await?;
        let events = collect_events(stream).await?;

        if events.is_empty() {
            return Ok(CycleReport {
                fetched: 0,
                applied: 0,
                skipped: 0,
                current_sequence: start,
                outcome: CycleOutcome::Idle,
            });
        }
        let fetched = events.len();

        let mut reduced = Vec::with_capacity(fetched);
        for event in &events {
            match self.table.lookup(&event.aggregate_type, &event.event_type) {
                None => {
                    tracing::debug!(
                        sequence = event.sequence,
                        aggregate_type = %event.aggregate_type,
                        event_type = %event.event_type,
                        "no reducer registered, skipping"
                    );
                    reduced.push(Reduced::Unhandled(event.sequence));
                }
                Some(reduce) => match reduce(event) {
                    Ok(statements) => {
                        tracing::debug!(
                            sequence = event.sequence,
                            event_type = %event.event_type,
                            statements = statements.len(),
                            "event reduced"
                        );
                        reduced.push(Reduced::Statements(event.sequence, statements));
                    }
                    Err(e) => {
                        reduced.push(Reduced::Failed(event.sequence, e.to_string()));
                        break;
                    }
                },
            }
        }

        let name = self.name();
        let instance = instance_id.to_string();
        let max_failures = self.config.max_failure_count.max(1);
        let report = self
            .db
            .transaction(move |tx| commit_batch(tx, name, &instance, start, reduced, max_failures))
            .await?;
        let report = CycleReport { fetched, ..report };

        match report.outcome {
            CycleOutcome::Failed {
                sequence,
                failure_count,
            } if failure_count >= max_failures => {
                tracing::warn!(sequence, failure_count, "event failed too often, skipped");
            }
            CycleOutcome::Failed {
                sequence,
                failure_count,
            } => {
                tracing::warn!(sequence, failure_count, "event failed, will retry");
            }
            _ => {
                tracing::info!(
                    applied = report.applied,
                    skipped = report.skipped,
                    sequence = report.current_sequence,
                    "projection cycle committed"
                );
            }
        }
        Ok(report)
    }
}

const EVENT_SAVEPOINT: &str = "projection_event";

/// The commit half of a cycle, run inside one transaction.
fn commit_batch(
    tx: &rusqlite::Transaction<'_>,
    name: &'static str,
    instance_id: &str,
    start: u64,
    reduced: Vec<Reduced>,
    max_failures: u32,
) -> Result<CycleReport, ProjectionError> {
    let found = tracker::current_sequence(tx, name, instance_id)?;
    if found != start {
        return Err(ProjectionError::Moved {
            projection: name,
            instance_id: instance_id.to_string(),
            expected: start,
            found,
        });
    }

    let mut last = start;
    let mut applied = 0;
    let mut skipped = 0;
    let mut failure = None;
    for item in reduced {
        match item {
            Reduced::Unhandled(sequence) => {
                last = sequence;
                skipped += 1;
            }
            Reduced::Statements(sequence, statements) => {
                tx.execute_batch(&format!("SAVEPOINT {EVENT_SAVEPOINT}"))?;
                match execute_statements(tx, &statements) {
                    Ok(_) => {
                        tx.execute_batch(&format!("RELEASE {EVENT_SAVEPOINT}"))?;
                        last = sequence;
                        applied += 1;
                    }
                    Err(e) => {
                        tx.execute_batch(&format!(
                            "ROLLBACK TO {EVENT_SAVEPOINT}; RELEASE {EVENT_SAVEPOINT}"
                        ))?;
                        failure = Some((sequence, e.to_string()));
                        break;
                    }
                }
            }
            Reduced::Failed(sequence, error) => {
                failure = Some((sequence, error));
                break;
            }
        }
    }

    let now = now_millis();
    let mut outcome = CycleOutcome::Committed;
    if let Some((sequence, error)) = failure {
        tracing::debug!(sequence, error = %error, "recording projection failure");
        let failure_count = tracker::record_failure(tx, name, instance_id, sequence, &error, now)?;
        if failure_count >= max_failures {
            tracker::mark_skipped(tx, name, instance_id, sequence)?;
            last = sequence;
            skipped += 1;
        }
        outcome = CycleOutcome::Failed {
            sequence,
            failure_count,
        };
    }

    if last > start {
        tracker::advance(tx, name, instance_id, last, now)?;
    }

    Ok(CycleReport {
        fetched: 0,
        applied,
        skipped,
        current_sequence: last,
        outcome,
    })
}
