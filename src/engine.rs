//! Composition root: wires the event store, command handler, projections,
//! queries and the live scheduler together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::admin::Admin;
use crate::command::{CommandConfig, Commands};
use crate::error::StoreError;
use crate::eventstore::{EventStore, SqliteEventStore};
use crate::executor::{ExecutorError, ProjectionDb};
use crate::live::{LiveConfig, LiveError, LiveHandle};
use crate::projection::{
    CycleOutcome, Projection, ProjectionConfig, ProjectionError, ProjectionRunner, ReducerTable,
};
use crate::projections::features::FeaturesProjection;
use crate::projections::quota::QuotaProjection;
use crate::query::Queries;

/// Errors from opening or operating an [`Engine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The event store could not be opened.
    #[error("event store: {0}")]
    Store(#[from] StoreError),

    /// The projection database could not be opened.
    #[error("projection database: {0}")]
    Executor(#[from] ExecutorError),

    /// A projection failed to initialize or catch up.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// [`Engine::start_live`] was already called on this engine.
    #[error("live scheduler already started")]
    LiveAlreadyStarted,

    /// The live scheduler did not stop cleanly.
    #[error(transparent)]
    Live(#[from] LiveError),
}

/// The assembled engine.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped, and clones share
/// the same databases and live scheduler.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn EventStore>,
    db: ProjectionDb,
    commands: Commands,
    runners: Arc<Vec<ProjectionRunner>>,
    live_config: LiveConfig,
    live_handle: Arc<tokio::sync::Mutex<Option<LiveHandle>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let projections: Vec<_> = self.runners.iter().map(ProjectionRunner::name).collect();
        f.debug_struct("Engine")
            .field("projections", &projections)
            .field("live_config", &self.live_config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start configuring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The command handler.
    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    /// Read-side queries over the projection database.
    pub fn queries(&self) -> Queries {
        Queries::new(self.db.clone())
    }

    /// Failed-event administration.
    pub fn admin(&self) -> Admin {
        Admin::new(self.db.clone())
    }

    /// The event store.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The database holding read models and projection progress.
    pub fn projection_db(&self) -> &ProjectionDb {
        &self.db
    }

    /// Names of the registered projections, in registration order.
    pub fn projection_names(&self) -> Vec<&'static str> {
        self.runners.iter().map(ProjectionRunner::name).collect()
    }

    /// Bring every projection on `instance_id` up to date with the event
    /// store as of this call.
    ///
    /// Each projection runs cycles until one comes back idle. A failing
    /// event is retried until it is skipped, so this always terminates.
    ///
    /// # Returns
    ///
    /// The number of events applied across all projections.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Projection`] if a cycle aborts.
    pub async fn trigger(&self, instance_id: &str) -> Result<usize, EngineError> {
        let mut applied = 0;
        for runner in self.runners.iter() {
            loop {
                let report = runner.run_once(instance_id).await?;
                applied += report.applied;
                if report.outcome == CycleOutcome::Idle {
                    break;
                }
            }
        }
        tracing::debug!(instance_id, applied, "projections triggered");
        Ok(applied)
    }

    /// Start the live scheduler.
    ///
    /// Can only be called once per engine; clones share the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LiveAlreadyStarted`] if the scheduler is
    /// already running.
    pub async fn start_live(&self) -> Result<LiveHandle, EngineError> {
        let mut guard = self.live_handle.lock().await;
        if guard.is_some() {
            return Err(EngineError::LiveAlreadyStarted);
        }
        let handle = LiveHandle::spawn(
            self.runners.to_vec(),
            Arc::clone(&self.store),
            self.live_config.clone(),
        );
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the live scheduler if it is running. A no-op otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Live`] if the scheduler task failed.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let handle = self.live_handle.lock().await.clone();
        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

/// Builder for [`Engine`].
///
/// The features and quota projections are always registered; queries read
/// their tables. Both databases are in memory unless a path is given.
///
/// # Examples
///
/// ```no_run
/// use eventfold_iam::Engine;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = Engine::builder()
///     .events_path("events.db")
///     .projections_path("projections.db")
///     .open()
///     .await?;
/// engine.start_live().await?;
/// # Ok(())
/// # }
/// ```
pub struct EngineBuilder {
    events_path: Option<PathBuf>,
    projections_path: Option<PathBuf>,
    store: Option<Arc<dyn EventStore>>,
    tables: Vec<ReducerTable>,
    command_config: CommandConfig,
    projection_config: ProjectionConfig,
    live_config: LiveConfig,
}

impl EngineBuilder {
    /// Create a builder with the built-in projections and default
    /// configuration.
    pub fn new() -> Self {
        Self {
            events_path: None,
            projections_path: None,
            store: None,
            tables: vec![
                ReducerTable::of::<FeaturesProjection>(),
                ReducerTable::of::<QuotaProjection>(),
            ],
            command_config: CommandConfig::default(),
            projection_config: ProjectionConfig::default(),
            live_config: LiveConfig::default(),
        }
    }

    /// Store events in the `SQLite` file at `path`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn events_path(mut self, path: impl AsRef<Path>) -> Self {
        self.events_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Store read models and projection progress in the `SQLite` file at
    /// `path`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn projections_path(mut self, path: impl AsRef<Path>) -> Self {
        self.projections_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use `store` instead of opening a `SQLite` event store. Takes
    /// precedence over [`events_path`](EngineBuilder::events_path).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an additional projection. Registering the same projection
    /// twice has no effect.
    ///
    /// # Type Parameters
    ///
    /// * `P` - A type implementing [`Projection`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn projection<P: Projection>(mut self) -> Self {
        if self.tables.iter().all(|t| t.name() != P::NAME) {
            self.tables.push(ReducerTable::of::<P>());
        }
        self
    }

    /// Set the command retry configuration.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn command_config(mut self, config: CommandConfig) -> Self {
        self.command_config = config;
        self
    }

    /// Set the projection cycle configuration, shared by all projections.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn projection_config(mut self, config: ProjectionConfig) -> Self {
        self.projection_config = config;
        self
    }

    /// Set the live scheduler configuration used by
    /// [`Engine::start_live`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.live_config = config;
        self
    }

    /// Open both databases and create every projection's tables.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Store`] if the event store cannot be opened.
    /// * [`EngineError::Executor`] if the projection database cannot be
    ///   opened.
    /// * [`EngineError::Projection`] if a projection schema fails.
    pub async fn open(self) -> Result<Engine, EngineError> {
        let store: Arc<dyn EventStore> = match (self.store, &self.events_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteEventStore::open(path)?),
            (None, None) => Arc::new(SqliteEventStore::in_memory()?),
        };
        let db = match &self.projections_path {
            Some(path) => ProjectionDb::open(path)?,
            None => ProjectionDb::in_memory()?,
        };

        let mut runners = Vec::with_capacity(self.tables.len());
        for table in self.tables {
            let runner = ProjectionRunner::new(
                table,
                Arc::clone(&store),
                db.clone(),
                self.projection_config.clone(),
            );
            runner.init().await?;
            runners.push(runner);
        }
        tracing::info!(
            projections = runners.len(),
            events_path = ?self.events_path,
            projections_path = ?self.projections_path,
            "engine opened"
        );

        Ok(Engine {
            commands: Commands::new(Arc::clone(&store)).with_config(self.command_config),
            store,
            db,
            runners: Arc::new(runners),
            live_config: self.live_config,
            live_handle: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assertions() {
        assert_send_sync::<Engine>();
        assert_send_sync::<LiveHandle>();
    }
    let _ = assertions;
};
