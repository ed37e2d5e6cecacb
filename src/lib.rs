//! Event-sourced command/query engine for instance-scoped IAM data.
//!
//! Commands rebuild a write model from the event store, validate against
//! it, and append new events under optimistic concurrency. Projections fold
//! the committed events into `SQLite` read models that [`Queries`] serve.

mod admin;
mod command;
pub mod domain;
mod engine;
mod error;
mod event;
mod eventstore;
mod executor;
mod live;
mod projection;
pub mod projections;
mod query;
mod sqlite;
mod statement;
mod tracker;
mod write_model;

pub use admin::{Admin, AdminError};
pub use command::{CommandConfig, CommandContext, Commands, Committed, ObjectDetails};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use error::{CommandError, StoreError};
pub use event::{
    Aggregate, DomainEvent, Event, ProposedEvent, decode_domain_event, encode_domain_event,
};
pub use eventstore::{
    EventFilter, EventStore, EventStream, ExpectedVersion, SqliteEventStore, collect_events,
};
pub use executor::{ExecutorError, ProjectionDb, execute_statements};
pub use live::{LiveConfig, LiveError, LiveHandle};
pub use projection::{
    AggregateReducer, CycleOutcome, CycleReport, EventReducer, Projection, ProjectionConfig,
    ProjectionError, ProjectionRunner, ReduceError, ReduceFn, ReducerTable, decode_payload,
};
pub use query::{Queries, QueryError};
pub use sqlite::DbError;
pub use statement::{Column, Statement, Value};
pub use tracker::{FailedEvent, ProjectionState, TrackerError};
pub use write_model::{PolicyState, WriteModel, WriteModelBase, reduce};
