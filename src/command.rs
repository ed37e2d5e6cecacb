//! Command context, the command handler, and the conflict retry combinator.
//!
//! Every domain command follows the same pipeline: validate the request,
//! [`fill`](Commands::fill) a fresh write model from the event store, check
//! preconditions against it, [`push`](Commands::push) the decided events
//! with an expected version taken from the model, and fold the committed
//! events back into the model. The domain modules add their commands as
//! further `impl Commands` blocks.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::error::CommandError;
use crate::event::{Event, encode_domain_event};
use crate::eventstore::{EventStore, ExpectedVersion, collect_events};
use crate::write_model::{WriteModel, WriteModelBase, reduce};

/// Cross-cutting metadata passed alongside a command.
///
/// The instance id is the tenancy boundary and always comes from the
/// caller. Editor and correlation id are stamped onto every appended event.
///
/// # Examples
///
/// ```
/// use eventfold_iam::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::new("instance-1")
///     .with_editor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.instance_id, "instance-1");
/// assert_eq!(ctx.editor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Instance (tenant) the command runs in.
    pub instance_id: String,
    /// Identity of the user or service issuing the command.
    pub editor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary request metadata, available to command implementations.
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Create a context for `instance_id`.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Set the editor identity.
    ///
    /// # Arguments
    ///
    /// * `editor` - Any value convertible to `String` identifying who issued
    ///   the command (e.g. a user ID or service name).
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the editor set.
    pub fn with_editor(mut self, editor: impl Into<String>) -> Self {
        self.editor = Some(editor.into());
        self
    }

    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Any value convertible to `String` used to correlate this
    ///   command with other operations across aggregates.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` with the correlation ID set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Reject contexts without an instance id.
    pub(crate) fn validate(&self) -> Result<(), CommandError> {
        if self.instance_id.trim().is_empty() {
            return Err(CommandError::invalid("instance id is required"));
        }
        Ok(())
    }
}

/// Where a successful command left its aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDetails {
    /// Sequence of the last event the command appended.
    pub sequence: u64,
    /// Creation date of that event.
    pub change_date: DateTime<Utc>,
    /// Owner of the aggregate.
    pub resource_owner: String,
}

impl ObjectDetails {
    pub(crate) fn from_base(base: &WriteModelBase) -> Self {
        Self {
            sequence: base.processed_sequence,
            change_date: base.change_date.unwrap_or_default(),
            resource_owner: base.resource_owner.clone(),
        }
    }
}

/// A command's resulting domain view together with where it left the
/// aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committed<T> {
    /// The state after the command, as folded from the committed events.
    pub value: T,
    /// Sequence, change date and owner of the last appended event.
    pub details: ObjectDetails,
}

/// Tuning for the command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    /// How many times a command runs in total before a concurrency conflict
    /// is returned to the caller. Values below 1 are treated as 1.
    pub max_attempts: u32,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// The command handler.
///
/// Holds the injected event store. `Clone` is cheap.
#[derive(Clone)]
pub struct Commands {
    store: Arc<dyn EventStore>,
    config: CommandConfig,
}

impl std::fmt::Debug for Commands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commands")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Commands {
    /// Create a command handler over `store` with default configuration.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            config: CommandConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: CommandConfig) -> Self {
        self.config = config;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// The event store commands append to.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Load every event of the model's aggregate and fold it in.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Internal`] if the store cannot be read or a
    /// stored event of a known type does not decode.
    pub async fn fill<W: WriteModel>(&self, model: &mut W) -> Result<(), CommandError> {
        let instance_id = model.base().instance_id.clone();
        let stream = self
            .store
            .filter(&instance_id, model.event_filter())
            .await?;
        let events = collect_events(stream).await?;
        reduce(model, &events)?;
        tracing::debug!(
            instance_id = %instance_id,
            aggregate_type = model.aggregate_type(),
            aggregate_id = %model.base().aggregate_id,
            version = model.base().version,
            events = events.len(),
            "write model filled"
        );
        Ok(())
    }

    /// Append `events` on behalf of `model` and fold the committed events
    /// back into it.
    ///
    /// The expected version is the version the model observed, so any
    /// append to the same aggregate since [`fill`](Self::fill) makes this
    /// call fail with [`CommandError::ConcurrencyConflict`].
    ///
    /// # Arguments
    ///
    /// * `model` - The filled write model the events were decided against.
    /// * `events` - Domain events to append, in order.
    /// * `ctx` - Context whose editor and correlation id are stamped on the
    ///   events.
    ///
    /// # Returns
    ///
    /// The committed events.
    ///
    /// # Errors
    ///
    /// * [`CommandError::ConcurrencyConflict`] if the aggregate moved.
    /// * [`CommandError::Internal`] on codec or storage failures.
    pub async fn push<W: WriteModel>(
        &self,
        model: &mut W,
        events: &[W::Event],
        ctx: &CommandContext,
    ) -> Result<Vec<Event>, CommandError> {
        let proposed = events
            .iter()
            .map(|e| encode_domain_event(e, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CommandError::Internal(format!("encode event: {e}")))?;

        let expected = ExpectedVersion::from_version(model.base().version);
        let committed = self
            .store
            .append(&model.aggregate(), expected, proposed)
            .await?;
        reduce(model, &committed)?;
        Ok(committed)
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached.
    ///
    /// `attempt` must perform the whole load/decide/append cycle so that
    /// every retry decides against freshly loaded state. Only
    /// [`CommandError::ConcurrencyConflict`] is retried.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn retry_on_conflict<T, F, Fut>(
        &self,
        command: &'static str,
        mut attempt: F,
    ) -> Result<T, CommandError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CommandError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let span = tracing::info_span!("command", command);
        async {
            let mut tries = 0;
            loop {
                tries += 1;
                match attempt().await {
                    Err(e) if e.is_retryable() && tries < max_attempts => {
                        tracing::warn!(
                            attempt = tries,
                            error = %e,
                            "concurrency conflict, retrying"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(attempt = tries, error = %e, "command rejected");
                        return Err(e);
                    }
                    Ok(value) => return Ok(value),
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::eventstore::SqliteEventStore;
    use crate::write_model::test_fixtures::{Counter, CounterEvent};

    fn commands() -> Commands {
        Commands::new(Arc::new(SqliteEventStore::in_memory().expect("store")))
    }

    fn conflict() -> CommandError {
        CommandError::ConcurrencyConflict {
            aggregate_type: "counter".into(),
            aggregate_id: "c-1".into(),
            expected: ExpectedVersion::Exact(1),
            actual: 2,
        }
    }

    #[test]
    fn default_context_has_no_optional_fields_set() {
        let ctx = CommandContext::new("inst");
        assert_eq!(ctx.instance_id, "inst");
        assert_eq!(ctx.editor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.metadata, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::new("inst")
            .with_editor("admin")
            .with_correlation_id("req-abc")
            .with_metadata(json!({"source": "test"}));

        assert_eq!(ctx.editor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn builder_accepts_string_owned() {
        let ctx = CommandContext::new(String::from("inst"))
            .with_editor(String::from("svc-payments"))
            .with_correlation_id(String::from("id-007"));

        assert_eq!(ctx.editor.as_deref(), Some("svc-payments"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("id-007"));
    }

    #[test]
    fn blank_instance_id_is_invalid() {
        assert!(matches!(
            CommandContext::new("  ").validate(),
            Err(CommandError::InvalidArgument(_))
        ));
        assert!(CommandContext::new("inst").validate().is_ok());
    }

    #[test]
    fn command_context_serde_roundtrip() {
        let ctx = CommandContext::new("inst")
            .with_editor("user-1")
            .with_correlation_id("corr-1");

        let json = serde_json::to_string(&ctx).expect("serialization should succeed");
        let back: CommandContext =
            serde_json::from_str(&json).expect("deserialization should succeed");

        assert_eq!(back.instance_id, ctx.instance_id);
        assert_eq!(back.editor, ctx.editor);
        assert_eq!(back.correlation_id, ctx.correlation_id);
    }

    #[tokio::test]
    async fn push_appends_and_folds_back() {
        let commands = commands();
        let ctx = CommandContext::new("inst").with_editor("user-1");

        let mut model = Counter::new("inst", "c-1");
        commands.fill(&mut model).await.expect("fill");
        assert_eq!(model.base.version, 0);

        let committed = commands
            .push(
                &mut model,
                &[CounterEvent::Incremented, CounterEvent::Added { amount: 4 }],
                &ctx,
            )
            .await
            .expect("push");

        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].editor_id.as_deref(), Some("user-1"));
        assert_eq!(model.value, 5);
        assert_eq!(model.base.version, 2);
        assert_eq!(model.base.processed_sequence, 2);

        let details = ObjectDetails::from_base(&model.base);
        assert_eq!(details.sequence, 2);
        assert_eq!(details.change_date, committed[1].creation_date);
        assert_eq!(details.resource_owner, "c-1");

        let mut reloaded = Counter::new("inst", "c-1");
        commands.fill(&mut reloaded).await.expect("refill");
        assert_eq!(reloaded.value, 5);
        assert_eq!(reloaded.base.version, 2);
    }

    #[tokio::test]
    async fn stale_model_push_is_a_conflict() {
        let commands = commands();
        let ctx = CommandContext::new("inst");

        let mut stale = Counter::new("inst", "c-1");
        commands.fill(&mut stale).await.expect("fill");

        let mut fresh = Counter::new("inst", "c-1");
        commands.fill(&mut fresh).await.expect("fill");
        commands
            .push(&mut fresh, &[CounterEvent::Incremented], &ctx)
            .await
            .expect("first push");

        let err = commands
            .push(&mut stale, &[CounterEvent::Incremented], &ctx)
            .await
            .expect_err("stale push");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retry_reruns_only_on_conflict() {
        let commands = commands();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = commands
            .retry_on_conflict("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(conflict())
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("second attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = commands
            .retry_on_conflict("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CommandError::NotFound("x".into()))
            })
            .await
            .expect_err("not found is final");
        assert!(matches!(err, CommandError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let commands = commands().with_config(CommandConfig { max_attempts: 2 });
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = commands
            .retry_on_conflict("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(conflict())
            })
            .await
            .expect_err("always conflicts");
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
