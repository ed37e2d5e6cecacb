//! Live projection scheduling.
//!
//! This module provides [`LiveConfig`] for tuning how often projections poll
//! the event store and how they back off after errors, and [`LiveHandle`]
//! for stopping a running scheduler.
//!
//! The scheduler is a supervisor task that periodically discovers the
//! instances present in the event store and spawns one worker per
//! (projection, instance) pair. Each worker calls
//! [`ProjectionRunner::run_once`] in a loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::eventstore::EventStore;
use crate::projection::{CycleOutcome, ProjectionRunner};

/// Configuration for the live scheduler.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_iam::LiveConfig;
///
/// let config = LiveConfig {
///     poll_interval: Duration::from_millis(100),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.retry_base_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    /// How long an idle worker waits before polling again. The supervisor
    /// looks for new instances at the same rate.
    ///
    /// Default: 1 second.
    pub poll_interval: Duration,

    /// First delay after a failed cycle. Doubles on each consecutive
    /// failure up to [`retry_max_delay`](LiveConfig::retry_max_delay) and
    /// resets after a clean cycle.
    ///
    /// Default: 1 second.
    pub retry_base_delay: Duration,

    /// Maximum delay between retries.
    ///
    /// Default: 30 seconds.
    pub retry_max_delay: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

/// Errors from stopping the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The supervisor task panicked or was cancelled.
    #[error("live scheduler task failed: {0}")]
    TaskFailed(String),
}

/// Handle for stopping the live scheduler.
///
/// Dropping every clone of the handle stops the scheduler the same way
/// [`shutdown`](LiveHandle::shutdown) does, but without waiting for it.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct LiveHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("stopping", &*self.shutdown_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl LiveHandle {
    /// Start the scheduler for `runners` over the instances of `store`.
    pub(crate) fn spawn(
        runners: Vec<ProjectionRunner>,
        store: Arc<dyn EventStore>,
        config: LiveConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(runners, store, config, shutdown_rx));
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Signal every worker to stop and wait until they have.
    ///
    /// A worker in the middle of a cycle finishes it first, so no cycle is
    /// cut short. Calling `shutdown` more than once is safe; later calls
    /// return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::TaskFailed`] if the supervisor task panicked.
    pub async fn shutdown(&self) -> Result<(), LiveError> {
        // The receiver may already be gone if the supervisor exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| LiveError::TaskFailed(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Wait for `delay` or a shutdown signal, whichever comes first.
///
/// Returns `true` if the caller should stop. A dropped sender counts as a
/// shutdown signal.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = shutdown_rx.changed() => {
            if changed.is_err() {
                return true;
            }
        }
    }
    *shutdown_rx.borrow()
}

/// Discover instances and keep one worker running per
/// (projection, instance) pair until shutdown, then wait for the workers.
///
/// A worker that has stopped before shutdown, for instance because a
/// reducer panicked, is replaced on the next discovery pass.
async fn supervise(
    runners: Vec<ProjectionRunner>,
    store: Arc<dyn EventStore>,
    config: LiveConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut workers: HashMap<(&'static str, String), JoinHandle<()>> = HashMap::new();
    tracing::info!(projections = runners.len(), "live scheduler started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match store.instances().await {
            Ok(instances) => {
                for instance_id in instances {
                    for runner in &runners {
                        let key = (runner.name(), instance_id.clone());
                        if workers.get(&key).is_some_and(|w| !w.is_finished()) {
                            continue;
                        }
                        if let Some(finished) = workers.remove(&key) {
                            let error = finished.await.err().map(|e| e.to_string());
                            tracing::warn!(
                                projection = runner.name(),
                                instance_id = %instance_id,
                                error = error.as_deref().unwrap_or("exited"),
                                "projection worker stopped, restarting"
                            );
                        }
                        tracing::debug!(
                            projection = runner.name(),
                            instance_id = %instance_id,
                            "spawning projection worker"
                        );
                        let worker = tokio::spawn(run_worker(
                            runner.clone(),
                            instance_id.clone(),
                            config.clone(),
                            shutdown_rx.clone(),
                        ));
                        workers.insert(key, worker);
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "live scheduler: instance discovery failed");
            }
        }

        if sleep_or_shutdown(config.poll_interval, &mut shutdown_rx).await {
            break;
        }
    }

    for ((projection, instance_id), worker) in workers {
        if let Err(e) = worker.await {
            tracing::error!(
                projection,
                instance_id = %instance_id,
                error = %e,
                "projection worker panicked"
            );
        }
    }
    tracing::info!("live scheduler stopped");
}

/// Drive one projection on one instance until shutdown.
///
/// A full batch means more events are likely waiting, so the worker runs
/// again without sleeping. Errors and failed events back off exponentially.
async fn run_worker(
    runner: ProjectionRunner,
    instance_id: String,
    config: LiveConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let batch_size = usize::try_from(runner.config().batch_size).unwrap_or(usize::MAX);
    let mut backoff = config.retry_base_delay;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let delay = match runner.run_once(&instance_id).await {
            Ok(report) => match report.outcome {
                CycleOutcome::Failed { .. } => {
                    let delay = backoff;
                    backoff = backoff.saturating_mul(2).min(config.retry_max_delay);
                    delay
                }
                CycleOutcome::Committed if report.fetched >= batch_size => {
                    backoff = config.retry_base_delay;
                    continue;
                }
                CycleOutcome::Committed | CycleOutcome::Idle => {
                    backoff = config.retry_base_delay;
                    config.poll_interval
                }
            },
            Err(e) => {
                tracing::error!(
                    projection = runner.name(),
                    instance_id = %instance_id,
                    error = %e,
                    retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "projection cycle failed"
                );
                let delay = backoff;
                backoff = backoff.saturating_mul(2).min(config.retry_max_delay);
                delay
            }
        };

        if sleep_or_shutdown(delay, &mut shutdown_rx).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::command::{CommandContext, Commands};
    use crate::domain::features::Features;
    use crate::event::Event;
    use crate::eventstore::SqliteEventStore;
    use crate::executor::ProjectionDb;
    use crate::projection::{
        AggregateReducer, EventReducer, Projection, ProjectionConfig, ReduceError, ReducerTable,
    };
    use crate::projections::features::FeaturesProjection;
    use crate::query::Queries;
    use crate::statement::Statement;

    static PANICKED: AtomicBool = AtomicBool::new(false);

    /// Panics on its first event, then reduces everything to nothing.
    struct PanicsOnce;

    fn panic_once(_event: &Event) -> Result<Vec<Statement>, ReduceError> {
        assert!(PANICKED.swap(true, Ordering::SeqCst), "reducer bug");
        Ok(Vec::new())
    }

    impl Projection for PanicsOnce {
        const NAME: &'static str = "panics_once";
        const SCHEMA: &'static str = "";

        fn reducers() -> Vec<AggregateReducer> {
            vec![AggregateReducer {
                aggregate_type: "org",
                event_reducers: vec![EventReducer {
                    event_type: "features.set",
                    reduce: panic_once,
                }],
            }]
        }
    }

    fn fast_config() -> LiveConfig {
        LiveConfig {
            poll_interval: Duration::from_millis(10),
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(50),
        }
    }

    async fn setup() -> (Arc<dyn EventStore>, ProjectionDb, ProjectionRunner) {
        let store: Arc<dyn EventStore> =
            Arc::new(SqliteEventStore::in_memory().expect("store"));
        let db = ProjectionDb::in_memory().expect("db");
        let runner = ProjectionRunner::new(
            ReducerTable::of::<FeaturesProjection>(),
            Arc::clone(&store),
            db.clone(),
            ProjectionConfig {
                batch_size: 2,
                ..ProjectionConfig::default()
            },
        );
        runner.init().await.expect("init");
        (store, db, runner)
    }

    fn tier(name: &str) -> Features {
        Features {
            tier_name: name.into(),
            ..Features::default()
        }
    }

    /// Poll until the runner has reached `sequence` on `instance_id`.
    async fn wait_for(runner: &ProjectionRunner, instance_id: &str, sequence: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if runner.current_sequence(instance_id).await.expect("seq") >= sequence {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("projection did not catch up");
    }

    #[test]
    fn live_config_default_values() {
        let config = LiveConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.retry_max_delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn workers_follow_existing_and_new_instances() {
        let (store, db, runner) = setup().await;
        let commands = Commands::new(Arc::clone(&store));
        let inst1 = CommandContext::new("inst-1");
        for name in ["a", "b", "c"] {
            commands
                .set_org_features(&inst1, "O1", &tier(name))
                .await
                .expect("set");
        }

        let handle = LiveHandle::spawn(vec![runner.clone()], Arc::clone(&store), fast_config());
        // Three events with a batch size of two: drained across cycles.
        wait_for(&runner, "inst-1", 3).await;

        // An instance that appears after start gets its own worker.
        let inst2 = CommandContext::new("inst-2");
        commands
            .set_default_features(&inst2, &tier("default"))
            .await
            .expect("set default");
        wait_for(&runner, "inst-2", 1).await;

        handle.shutdown().await.expect("shutdown");

        let queries = Queries::new(db);
        let org = queries.org_features("inst-1", "O1").await.expect("query");
        assert_eq!(org.map(|f| f.tier_name), Some("c".to_string()));
        let default = queries.default_features("inst-2").await.expect("query");
        assert_eq!(default.map(|f| f.tier_name), Some("default".to_string()));
    }

    #[tokio::test]
    async fn panicked_worker_is_restarted() {
        let store: Arc<dyn EventStore> =
            Arc::new(SqliteEventStore::in_memory().expect("store"));
        let runner = ProjectionRunner::new(
            ReducerTable::of::<PanicsOnce>(),
            Arc::clone(&store),
            ProjectionDb::in_memory().expect("db"),
            ProjectionConfig::default(),
        );
        runner.init().await.expect("init");
        Commands::new(Arc::clone(&store))
            .set_org_features(&CommandContext::new("inst-1"), "O1", &tier("a"))
            .await
            .expect("set");

        let handle = LiveHandle::spawn(vec![runner.clone()], Arc::clone(&store), fast_config());
        wait_for(&runner, "inst-1", 1).await;
        assert!(PANICKED.load(Ordering::SeqCst));
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_stops_processing() {
        let (store, _db, runner) = setup().await;
        let handle = LiveHandle::spawn(vec![runner.clone()], Arc::clone(&store), fast_config());
        handle.shutdown().await.expect("shutdown");

        Commands::new(Arc::clone(&store))
            .set_org_features(&CommandContext::new("inst-1"), "O1", &tier("late"))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.current_sequence("inst-1").await.expect("seq"), 0);
    }

    #[tokio::test]
    async fn shutdown_twice_returns_ok() {
        let (store, _db, runner) = setup().await;
        let handle = LiveHandle::spawn(vec![runner], store, fast_config());
        let clone = handle.clone();
        handle.shutdown().await.expect("first shutdown");
        clone.shutdown().await.expect("second shutdown");
    }
}
