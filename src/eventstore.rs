//! The append-only, instance-scoped event store.
//!
//! [`EventStore`] is the only writer of the event log. Appends are
//! conditional on the aggregate's current version ([`ExpectedVersion`]);
//! reads go through an [`EventFilter`] and come back as a finite
//! [`EventStream`] ordered by sequence.
//!
//! [`SqliteEventStore`] is the built-in implementation.

use std::fmt;
use std::path::Path;
use std::pin::Pin;

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, TransactionBehavior, params, params_from_iter};
use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{Aggregate, Event, ProposedEvent};
use crate::sqlite::{Database, from_millis, from_sql_int, now_millis, to_millis, to_sql_int};

/// Schema for the event log.
const EVENTS_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS events (
    instance_id       TEXT    NOT NULL,
    sequence          INTEGER NOT NULL,
    aggregate_type    TEXT    NOT NULL,
    aggregate_id      TEXT    NOT NULL,
    aggregate_version INTEGER NOT NULL,
    event_id          TEXT    NOT NULL,
    event_type        TEXT    NOT NULL,
    payload           TEXT,
    creation_date     INTEGER NOT NULL,
    editor_id         TEXT,
    resource_owner    TEXT    NOT NULL,
    correlation_id    TEXT,
    PRIMARY KEY (instance_id, sequence),
    UNIQUE (instance_id, aggregate_type, aggregate_id, aggregate_version)
);

CREATE INDEX IF NOT EXISTS idx_events_aggregate
    ON events (instance_id, aggregate_type, aggregate_id, aggregate_version);
";

const SELECT_EVENTS: &str = "SELECT instance_id, sequence, aggregate_type, aggregate_id, \
     aggregate_version, event_id, event_type, payload, creation_date, editor_id, \
     resource_owner, correlation_id FROM events";

/// A finite, non-restartable stream of committed events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, StoreError>> + Send>>;

/// Expected aggregate version for an optimistic-concurrency append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current version (no concurrency check).
    Any,
    /// The aggregate must not have any events yet.
    NoStream,
    /// The aggregate must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// The expectation matching a write model that has folded `version`
    /// events.
    pub fn from_version(version: u64) -> Self {
        if version == 0 {
            Self::NoStream
        } else {
            Self::Exact(version)
        }
    }

    fn matches(self, actual: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => actual == 0,
            Self::Exact(v) => actual == v,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any version"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(v) => write!(f, "version {v}"),
        }
    }
}

/// Predicate over the events of one instance.
///
/// Empty lists mean "no restriction". Built with chained setters:
///
/// ```
/// use eventfold_iam::EventFilter;
///
/// let filter = EventFilter::new()
///     .aggregate_types(["org"])
///     .aggregate_ids(["o-1"])
///     .sequence_after(10)
///     .limit(100);
/// assert_eq!(filter.max_events(), Some(100));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    aggregate_types: Vec<String>,
    aggregate_ids: Vec<String>,
    event_types: Vec<String>,
    resource_owner: Option<String>,
    sequence_after: Option<u64>,
    sequence_until: Option<u64>,
    limit: Option<u64>,
}

impl EventFilter {
    /// A filter matching every event of the instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to these aggregate types.
    pub fn aggregate_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to these aggregate ids.
    pub fn aggregate_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to these event types.
    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to events stamped with this resource owner.
    pub fn resource_owner(mut self, owner: impl Into<String>) -> Self {
        self.resource_owner = Some(owner.into());
        self
    }

    /// Only events with `sequence > seq`.
    pub fn sequence_after(mut self, seq: u64) -> Self {
        self.sequence_after = Some(seq);
        self
    }

    /// Only events with `sequence <= seq`.
    pub fn sequence_until(mut self, seq: u64) -> Self {
        self.sequence_until = Some(seq);
        self
    }

    /// Return at most `n` events.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// The configured limit, if any.
    pub fn max_events(&self) -> Option<u64> {
        self.limit
    }

    /// Render the WHERE/ORDER/LIMIT tail and its positional arguments.
    fn to_sql(&self, instance_id: &str) -> (String, Vec<SqlValue>) {
        let mut clauses = vec!["instance_id = ?".to_string()];
        let mut args = vec![SqlValue::Text(instance_id.to_string())];

        let mut in_clause = |column: &str, values: &[String]| {
            if values.is_empty() {
                return;
            }
            let marks = vec!["?"; values.len()].join(", ");
            clauses.push(format!("{column} IN ({marks})"));
            args.extend(values.iter().cloned().map(SqlValue::Text));
        };
        in_clause("aggregate_type", &self.aggregate_types);
        in_clause("aggregate_id", &self.aggregate_ids);
        in_clause("event_type", &self.event_types);

        if let Some(owner) = &self.resource_owner {
            clauses.push("resource_owner = ?".to_string());
            args.push(SqlValue::Text(owner.clone()));
        }
        if let Some(after) = self.sequence_after {
            clauses.push("sequence > ?".to_string());
            args.push(SqlValue::Integer(to_sql_int(after)));
        }
        if let Some(until) = self.sequence_until {
            clauses.push("sequence <= ?".to_string());
            args.push(SqlValue::Integer(to_sql_int(until)));
        }

        let mut sql = format!(" WHERE {} ORDER BY sequence ASC", clauses.join(" AND "));
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(to_sql_int(limit)));
        }
        (sql, args)
    }
}

/// Durable, append-only, instance-scoped event log.
///
/// Implementations must be the only writer of their log and must make
/// [`append`](EventStore::append) atomic: either every proposed event is
/// committed or none is.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to `aggregate` if its current version matches
    /// `expected`.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Conflict`] if the version check fails.
    /// * [`StoreError::Invalid`] if the aggregate identity is incomplete.
    /// * [`StoreError::Database`] / [`StoreError::Codec`] on storage failures.
    async fn append(
        &self,
        aggregate: &Aggregate,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Read the events of `instance_id` matching `filter`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read cannot be started.
    async fn filter(&self, instance_id: &str, filter: EventFilter)
    -> Result<EventStream, StoreError>;

    /// Read the events of `instance_id` committed after `from_sequence`.
    ///
    /// Projections call this repeatedly; it is the polling half of the
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read cannot be started.
    async fn subscribe(
        &self,
        instance_id: &str,
        from_sequence: u64,
        filter: EventFilter,
    ) -> Result<EventStream, StoreError> {
        self.filter(instance_id, filter.sequence_after(from_sequence))
            .await
    }

    /// Highest sequence committed in `instance_id`, or 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failures.
    async fn latest_sequence(&self, instance_id: &str) -> Result<u64, StoreError>;

    /// All instances that have at least one event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failures.
    async fn instances(&self) -> Result<Vec<String>, StoreError>;
}

/// [`EventStore`] backed by a single `SQLite` database.
///
/// `Clone` is cheap; clones share the connection.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    db: Database,
}

impl SqliteEventStore {
    /// Open (or create) an event log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            db: Database::open(path, EVENTS_SCHEMA)?,
        })
    }

    /// Create an in-memory event log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            db: Database::in_memory(EVENTS_SCHEMA)?,
        })
    }
}

fn validate_aggregate(aggregate: &Aggregate) -> Result<(), StoreError> {
    if aggregate.instance_id.is_empty() {
        return Err(StoreError::Invalid("instance id is empty".into()));
    }
    if aggregate.aggregate_type.is_empty() || aggregate.aggregate_id.is_empty() {
        return Err(StoreError::Invalid("aggregate type and id must not be empty".into()));
    }
    Ok(())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_id: String = row.get(5)?;
    let payload: Option<String> = row.get(7)?;
    let payload = match payload {
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
        None => serde_json::Value::Null,
    };
    Ok(Event {
        instance_id: row.get(0)?,
        sequence: from_sql_int(row.get(1)?),
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        aggregate_version: from_sql_int(row.get(4)?),
        event_id: Uuid::parse_str(&event_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        event_type: row.get(6)?,
        payload,
        creation_date: from_millis(row.get(8)?),
        editor_id: row.get(9)?,
        resource_owner: row.get(10)?,
        correlation_id: row.get(11)?,
    })
}

#[async_trait::async_trait]
impl EventStore for SqliteEventStore {
    async fn append(
        &self,
        aggregate: &Aggregate,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        validate_aggregate(aggregate)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let aggregate = aggregate.clone();
        let committed = self
            .db
            .call(move |conn| -> Result<Vec<Event>, StoreError> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let actual: u64 = from_sql_int(tx.query_row(
                    "SELECT COALESCE(MAX(aggregate_version), 0) FROM events
                     WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3",
                    params![
                        aggregate.instance_id,
                        aggregate.aggregate_type,
                        aggregate.aggregate_id
                    ],
                    |row| row.get(0),
                )?);
                if !expected.matches(actual) {
                    return Err(StoreError::Conflict {
                        aggregate_type: aggregate.aggregate_type,
                        aggregate_id: aggregate.aggregate_id,
                        expected,
                        actual,
                    });
                }

                let last_sequence: u64 = from_sql_int(tx.query_row(
                    "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE instance_id = ?1",
                    params![aggregate.instance_id],
                    |row| row.get(0),
                )?);

                let creation_date = now_millis();
                let mut committed = Vec::with_capacity(events.len());
                for (offset, proposed) in (1u64..).zip(events) {
                    let event = Event {
                        instance_id: aggregate.instance_id.clone(),
                        aggregate_type: aggregate.aggregate_type.clone(),
                        aggregate_id: aggregate.aggregate_id.clone(),
                        aggregate_version: actual + offset,
                        sequence: last_sequence + offset,
                        event_id: Uuid::new_v4(),
                        event_type: proposed.event_type,
                        payload: proposed.payload,
                        creation_date,
                        editor_id: proposed.editor_id,
                        resource_owner: aggregate.resource_owner.clone(),
                        correlation_id: proposed.correlation_id,
                    };
                    let payload = if event.payload.is_null() {
                        None
                    } else {
                        Some(serde_json::to_string(&event.payload)?)
                    };
                    tx.execute(
                        "INSERT INTO events (instance_id, sequence, aggregate_type, aggregate_id,
                             aggregate_version, event_id, event_type, payload, creation_date,
                             editor_id, resource_owner, correlation_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            event.instance_id,
                            to_sql_int(event.sequence),
                            event.aggregate_type,
                            event.aggregate_id,
                            to_sql_int(event.aggregate_version),
                            event.event_id.to_string(),
                            event.event_type,
                            payload,
                            to_millis(event.creation_date),
                            event.editor_id,
                            event.resource_owner,
                            event.correlation_id,
                        ],
                    )?;
                    committed.push(event);
                }

                tx.commit()?;
                Ok(committed)
            })
            .await?;

        if let (Some(first), Some(last)) = (committed.first(), committed.last()) {
            tracing::info!(
                instance_id = %first.instance_id,
                aggregate_type = %first.aggregate_type,
                aggregate_id = %first.aggregate_id,
                version = last.aggregate_version,
                first_sequence = first.sequence,
                count = committed.len(),
                "events appended"
            );
        }
        Ok(committed)
    }

    async fn filter(
        &self,
        instance_id: &str,
        filter: EventFilter,
    ) -> Result<EventStream, StoreError> {
        let (tail, args) = filter.to_sql(instance_id);
        let events = self
            .db
            .call(move |conn| -> Result<Vec<Event>, StoreError> {
                let mut stmt = conn.prepare(&format!("{SELECT_EVENTS}{tail}"))?;
                let rows = stmt.query_map(params_from_iter(args), row_to_event)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        Ok(Box::pin(tokio_stream::iter(events.into_iter().map(Ok))))
    }

    async fn latest_sequence(&self, instance_id: &str) -> Result<u64, StoreError> {
        let instance_id = instance_id.to_string();
        self.db
            .call(move |conn| -> Result<u64, StoreError> {
                let seq: Option<i64> = conn
                    .query_row(
                        "SELECT MAX(sequence) FROM events WHERE instance_id = ?1",
                        params![instance_id],
                        |row| row.get::<_, Option<i64>>(0),
                    )
                    .optional()?
                    .flatten();
                Ok(seq.map_or(0, from_sql_int))
            })
            .await
    }

    async fn instances(&self) -> Result<Vec<String>, StoreError> {
        self.db
            .call(|conn| -> Result<Vec<String>, StoreError> {
                let mut stmt =
                    conn.prepare("SELECT DISTINCT instance_id FROM events ORDER BY instance_id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}

/// Drain an [`EventStream`] into a vector, stopping at the first error.
///
/// # Errors
///
/// Returns the first [`StoreError`] yielded by the stream.
pub async fn collect_events(mut stream: EventStream) -> Result<Vec<Event>, StoreError> {
    use tokio_stream::StreamExt;

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn org(instance: &str, id: &str) -> Aggregate {
        Aggregate::new(instance, "org", id, id)
    }

    fn proposed(event_type: &str) -> ProposedEvent {
        ProposedEvent {
            event_type: event_type.to_string(),
            payload: serde_json::json!({"k": event_type}),
            editor_id: Some("editor".into()),
            correlation_id: None,
        }
    }

    async fn read_all(store: &SqliteEventStore, instance: &str, filter: EventFilter) -> Vec<Event> {
        collect_events(store.filter(instance, filter).await.expect("filter"))
            .await
            .expect("collect")
    }

    #[tokio::test]
    async fn append_assigns_versions_and_sequences() {
        let store = SqliteEventStore::in_memory().expect("store");
        let committed = store
            .append(
                &org("i1", "o1"),
                ExpectedVersion::NoStream,
                vec![proposed("a"), proposed("b")],
            )
            .await
            .expect("append");

        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].aggregate_version, 1);
        assert_eq!(committed[1].aggregate_version, 2);
        assert_eq!(committed[0].sequence, 1);
        assert_eq!(committed[1].sequence, 2);
        assert_eq!(committed[0].resource_owner, "o1");

        let read = read_all(&store, "i1", EventFilter::new()).await;
        assert_eq!(read, committed);
    }

    #[tokio::test]
    async fn sequence_is_per_instance_and_versions_per_aggregate() {
        let store = SqliteEventStore::in_memory().expect("store");
        store
            .append(&org("i1", "o1"), ExpectedVersion::Any, vec![proposed("a")])
            .await
            .expect("append o1");
        let o2 = store
            .append(&org("i1", "o2"), ExpectedVersion::Any, vec![proposed("a")])
            .await
            .expect("append o2");
        let other = store
            .append(&org("i2", "o1"), ExpectedVersion::Any, vec![proposed("a")])
            .await
            .expect("append other instance");

        assert_eq!(o2[0].sequence, 2);
        assert_eq!(o2[0].aggregate_version, 1);
        assert_eq!(other[0].sequence, 1, "instances have separate sequences");
        assert_eq!(store.latest_sequence("i1").await.expect("latest"), 2);
        assert_eq!(store.latest_sequence("nope").await.expect("latest"), 0);
        assert_eq!(
            store.instances().await.expect("instances"),
            vec!["i1".to_string(), "i2".to_string()]
        );
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let store = SqliteEventStore::in_memory().expect("store");
        store
            .append(
                &org("i1", "o1"),
                ExpectedVersion::NoStream,
                vec![proposed("a")],
            )
            .await
            .expect("first append");

        let err = store
            .append(
                &org("i1", "o1"),
                ExpectedVersion::NoStream,
                vec![proposed("b")],
            )
            .await
            .expect_err("second NoStream append must conflict");
        assert!(matches!(err, StoreError::Conflict { actual: 1, .. }));

        // Nothing from the failed append was committed.
        assert_eq!(read_all(&store, "i1", EventFilter::new()).await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_exactly_one_wins_and_retry_succeeds() {
        let store = Arc::new(SqliteEventStore::in_memory().expect("store"));
        store
            .append(
                &org("i1", "o1"),
                ExpectedVersion::NoStream,
                vec![proposed("a")],
            )
            .await
            .expect("seed");

        let agg = org("i1", "o1");
        let (left, right) = tokio::join!(
            store.append(&agg, ExpectedVersion::Exact(1), vec![proposed("left")]),
            store.append(&agg, ExpectedVersion::Exact(1), vec![proposed("right")]),
        );
        let outcomes = [left.is_ok(), right.is_ok()];
        assert_eq!(
            outcomes.iter().filter(|ok| **ok).count(),
            1,
            "exactly one append must win"
        );
        let loser = if left.is_err() { left } else { right };
        assert!(matches!(loser, Err(StoreError::Conflict { actual: 2, .. })));

        // Retrying with the refreshed version succeeds.
        let retried = store
            .append(&agg, ExpectedVersion::Exact(2), vec![proposed("retry")])
            .await
            .expect("retry with refreshed version");
        assert_eq!(retried[0].aggregate_version, 3);
    }

    #[tokio::test]
    async fn filter_by_aggregate_event_type_and_sequence() {
        let store = SqliteEventStore::in_memory().expect("store");
        store
            .append(
                &org("i1", "o1"),
                ExpectedVersion::Any,
                vec![proposed("a"), proposed("b")],
            )
            .await
            .expect("append");
        store
            .append(
                &Aggregate::new("i1", "instance", "i1", "i1"),
                ExpectedVersion::Any,
                vec![proposed("a")],
            )
            .await
            .expect("append");

        let orgs = read_all(&store, "i1", EventFilter::new().aggregate_types(["org"])).await;
        assert_eq!(orgs.len(), 2);

        let only_a = read_all(&store, "i1", EventFilter::new().event_types(["a"])).await;
        assert_eq!(
            only_a.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 3]
        );

        let tail = store
            .subscribe("i1", 1, EventFilter::new().limit(1))
            .await
            .expect("subscribe");
        let tail = collect_events(tail).await.expect("collect");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 2);

        let window = read_all(
            &store,
            "i1",
            EventFilter::new().sequence_after(1).sequence_until(2),
        )
        .await;
        assert_eq!(window.len(), 1);

        let owned = read_all(&store, "i1", EventFilter::new().resource_owner("i1")).await;
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn filter_never_crosses_instances() {
        let store = SqliteEventStore::in_memory().expect("store");
        store
            .append(&org("i1", "o1"), ExpectedVersion::Any, vec![proposed("a")])
            .await
            .expect("append");
        let read = read_all(&store, "i2", EventFilter::new()).await;
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn empty_identity_is_rejected_and_empty_append_is_noop() {
        let store = SqliteEventStore::in_memory().expect("store");
        let err = store
            .append(&org("", "o1"), ExpectedVersion::Any, vec![proposed("a")])
            .await
            .expect_err("empty instance");
        assert!(matches!(err, StoreError::Invalid(_)));

        let none = store
            .append(&org("i1", "o1"), ExpectedVersion::Exact(9), Vec::new())
            .await
            .expect("empty append");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn null_payload_roundtrips() {
        let store = SqliteEventStore::in_memory().expect("store");
        let mut event = proposed("removed");
        event.payload = serde_json::Value::Null;
        store
            .append(&org("i1", "o1"), ExpectedVersion::Any, vec![event])
            .await
            .expect("append");
        let read = read_all(&store, "i1", EventFilter::new()).await;
        assert!(read[0].payload.is_null());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let path = tmp.path().join("events.db");
        {
            let store = SqliteEventStore::open(&path).expect("open");
            store
                .append(
                    &org("i1", "o1"),
                    ExpectedVersion::NoStream,
                    vec![proposed("a")],
                )
                .await
                .expect("append");
        }
        let store = SqliteEventStore::open(&path).expect("reopen");
        assert_eq!(store.latest_sequence("i1").await.expect("latest"), 1);
    }

    #[test]
    fn expected_version_from_version() {
        assert_eq!(ExpectedVersion::from_version(0), ExpectedVersion::NoStream);
        assert_eq!(ExpectedVersion::from_version(3), ExpectedVersion::Exact(3));
        assert!(ExpectedVersion::Any.matches(7));
        assert!(!ExpectedVersion::NoStream.matches(1));
    }
}
