//! Write models: transient folds of one aggregate's events used to decide
//! commands.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CommandError;
use crate::event::{Aggregate, DomainEvent, Event, decode_domain_event};
use crate::eventstore::EventFilter;

/// Lifecycle of a policy-like aggregate slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum PolicyState {
    /// Never added.
    #[default]
    Unspecified,
    /// Added and not removed since.
    Active,
    /// Removed; may be added again.
    Removed,
}

impl PolicyState {
    /// Whether the slice currently exists.
    pub fn exists(self) -> bool {
        self == Self::Active
    }
}

/// Bookkeeping every write model carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteModelBase {
    /// Instance the aggregate lives in.
    pub instance_id: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Owner stamped on appended events.
    pub resource_owner: String,
    /// Aggregate version of the last folded event; 0 before any event.
    pub version: u64,
    /// Sequence of the last folded event.
    pub processed_sequence: u64,
    /// Creation date of the last folded event.
    pub change_date: Option<DateTime<Utc>>,
}

impl WriteModelBase {
    /// An empty base for the given aggregate.
    pub fn new(
        instance_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            aggregate_id: aggregate_id.into(),
            resource_owner: resource_owner.into(),
            ..Self::default()
        }
    }
}

/// A transient, in-memory fold of one aggregate used to validate commands.
///
/// # Contract
///
/// - [`apply`](WriteModel::apply) must be pure and total. Events that do not
///   concern the model (for example another key on the same aggregate) are
///   ignored.
/// - The event enum uses adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`); its tags are the stored
///   event types and are listed in [`DomainEvent::EVENT_TYPES`].
pub trait WriteModel: Send {
    /// Aggregate type this model folds (e.g. `"org"`).
    const AGGREGATE_TYPE: &'static str;

    /// The events this model decides and understands.
    type Event: DomainEvent;

    /// Shared bookkeeping.
    fn base(&self) -> &WriteModelBase;

    /// Shared bookkeeping, mutably.
    fn base_mut(&mut self) -> &mut WriteModelBase;

    /// Fold one understood event into the model.
    fn apply(&mut self, event: &Self::Event);

    /// The aggregate type, for logging.
    fn aggregate_type(&self) -> &'static str {
        Self::AGGREGATE_TYPE
    }

    /// The aggregate identity appends go to.
    fn aggregate(&self) -> Aggregate {
        let base = self.base();
        Aggregate::new(
            base.instance_id.clone(),
            Self::AGGREGATE_TYPE,
            base.aggregate_id.clone(),
            base.resource_owner.clone(),
        )
    }

    /// The read that loads this model. Filters by aggregate identity only so
    /// that the folded version is the aggregate's real head.
    fn event_filter(&self) -> EventFilter {
        EventFilter::new()
            .aggregate_types([Self::AGGREGATE_TYPE])
            .aggregate_ids([self.base().aggregate_id.clone()])
            .sequence_after(self.base().processed_sequence)
    }
}

/// Fold committed events into `model`.
///
/// Every event newer than the model's version advances the base, whether or
/// not the model knows its type; known events are passed to
/// [`WriteModel::apply`]. Events at or below the current version are
/// skipped, so folding the same slice twice is harmless.
///
/// # Errors
///
/// Returns [`CommandError::Internal`] if an event of a known type has a
/// payload that does not decode. The model keeps the events folded before
/// it and must not be decided against.
pub fn reduce<W: WriteModel>(model: &mut W, events: &[Event]) -> Result<(), CommandError> {
    for event in events {
        if event.aggregate_version <= model.base().version {
            continue;
        }
        let decoded = decode_domain_event::<W::Event>(event).map_err(|e| {
            CommandError::Internal(format!(
                "decode {} at version {} of {}/{}: {e}",
                event.event_type, event.aggregate_version, event.aggregate_type, event.aggregate_id
            ))
        })?;
        if let Some(domain) = decoded {
            model.apply(&domain);
        }
        let base = model.base_mut();
        base.version = event.aggregate_version;
        base.processed_sequence = event.sequence;
        base.change_date = Some(event.creation_date);
        if !event.resource_owner.is_empty() {
            base.resource_owner.clone_from(&event.resource_owner);
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::test_fixtures::Counter;
    use super::*;
    use crate::event::test_fixtures::committed;

    #[test]
    fn reduce_applies_known_events_in_order() {
        let mut model = Counter::new("inst-1", "c-1");
        reduce(
            &mut model,
            &[
                committed("counter", "c-1", "counter.incremented", Value::Null, 1),
                committed("counter", "c-1", "counter.added", json!({"amount": 5}), 2),
            ],
        )
        .expect("reduce");
        assert_eq!(model.value, 6);
        assert_eq!(model.base.version, 2);
        assert_eq!(model.base.processed_sequence, 2);
        assert!(model.base.change_date.is_some());
    }

    #[test]
    fn unknown_events_advance_version_without_changing_state() {
        let mut model = Counter::new("inst-1", "c-1");
        reduce(
            &mut model,
            &[
                committed("counter", "c-1", "counter.incremented", Value::Null, 1),
                committed("counter", "c-1", "counter.renamed", json!({"name": "x"}), 2),
            ],
        )
        .expect("reduce");
        assert_eq!(model.value, 1);
        assert_eq!(model.base.version, 2);
    }

    #[test]
    fn malformed_payload_of_known_type_fails_the_fold() {
        let mut model = Counter::new("inst-1", "c-1");
        let err = reduce(
            &mut model,
            &[
                committed("counter", "c-1", "counter.incremented", Value::Null, 1),
                committed("counter", "c-1", "counter.added", json!({"amount": "x"}), 2),
            ],
        )
        .expect_err("bad payload");
        assert!(matches!(err, CommandError::Internal(_)));
        assert_eq!(model.value, 1);
        assert_eq!(model.base.version, 1, "stops before the bad event");
    }

    #[test]
    fn refolding_the_same_events_is_harmless() {
        let events = [
            committed("counter", "c-1", "counter.incremented", Value::Null, 1),
            committed("counter", "c-1", "counter.incremented", Value::Null, 2),
        ];
        let mut model = Counter::new("inst-1", "c-1");
        reduce(&mut model, &events).expect("first fold");
        reduce(&mut model, &events).expect("second fold");
        assert_eq!(model.value, 2);
    }

    #[test]
    fn aggregate_and_filter_use_identity() {
        let model = Counter::new("inst-1", "c-1");
        let aggregate = model.aggregate();
        assert_eq!(aggregate.aggregate_type, "counter");
        assert_eq!(aggregate.aggregate_id, "c-1");
        assert_eq!(aggregate.instance_id, "inst-1");
        assert_eq!(
            model.event_filter(),
            EventFilter::new()
                .aggregate_types(["counter"])
                .aggregate_ids(["c-1"])
                .sequence_after(0)
        );
    }

    #[test]
    fn policy_state_exists_only_when_active() {
        assert!(!PolicyState::Unspecified.exists());
        assert!(PolicyState::Active.exists());
        assert!(!PolicyState::Removed.exists());
    }
}
