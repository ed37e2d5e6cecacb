//! Event records, aggregate identity, and the payload codec.
//!
//! Domain events are Rust enums serialized with adjacently tagged serde
//! (`#[serde(tag = "type", content = "data")]`). The tag becomes the stored
//! `event_type` and the content becomes the stored `payload`. Decoding goes
//! the other way and returns `Ok(None)` for tags the enum does not know, which
//! is what keeps old write models working against newer event streams. A
//! known tag whose payload does not decode is an error.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::CommandContext;

/// Identity of an aggregate: the unit of optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Tenancy boundary the aggregate lives in.
    pub instance_id: String,
    /// Aggregate type name (e.g. `"org"`).
    pub aggregate_type: String,
    /// Aggregate identifier, unique within `(instance_id, aggregate_type)`.
    pub aggregate_id: String,
    /// Owner stamped on every event of this aggregate.
    pub resource_owner: String,
}

impl Aggregate {
    /// Build an aggregate identity.
    pub fn new(
        instance_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            resource_owner: resource_owner.into(),
        }
    }
}

/// A committed event as read back from the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tenancy boundary.
    pub instance_id: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Position within the aggregate, starting at 1, gap-free.
    pub aggregate_version: u64,
    /// Position within the instance, starting at 1, strictly increasing.
    pub sequence: u64,
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Decoded JSON payload; `Null` for events without data.
    pub payload: Value,
    /// Commit time, millisecond precision.
    pub creation_date: DateTime<Utc>,
    /// Who issued the command that produced this event.
    pub editor_id: Option<String>,
    /// Owner of the aggregate.
    pub resource_owner: String,
    /// Correlation ID from the command context.
    pub correlation_id: Option<String>,
}

impl Event {
    /// Decode the payload into a concrete type.
    ///
    /// A `Null` payload is decoded as an empty object so that payload structs
    /// with only optional fields accept events without data.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.payload {
            Value::Null => serde_json::from_value(Value::Object(serde_json::Map::new())),
            other => T::deserialize(other),
        }
    }
}

/// An event that has been decided but not yet appended.
///
/// The store fills in versions, sequence, id and creation date on append.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Event type tag.
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the tagged enum).
    pub payload: Value,
    /// Editor from the command context.
    pub editor_id: Option<String>,
    /// Correlation ID from the command context.
    pub correlation_id: Option<String>,
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// `event` must serialize as an adjacently tagged object
/// (`{"type": ..., "data": ...}`); fieldless variants may omit `"data"`.
///
/// # Errors
///
/// Returns `serde_json::Error` if serialization fails or the value is not a
/// tagged object.
pub fn encode_domain_event<E: Serialize>(
    event: &E,
    ctx: &CommandContext,
) -> serde_json::Result<ProposedEvent> {
    use serde::ser::Error as _;

    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to a tagged JSON object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(t)) => t,
        _ => {
            return Err(serde_json::Error::custom("domain event must carry a string 'type' tag"));
        }
    };
    let payload = obj.remove("data").unwrap_or(Value::Null);

    Ok(ProposedEvent {
        event_type,
        payload,
        editor_id: ctx.editor.clone(),
        correlation_id: ctx.correlation_id.clone(),
    })
}

/// A domain event enum that can be stored and read back.
///
/// The enum must serialize adjacently tagged, and
/// [`EVENT_TYPES`](DomainEvent::EVENT_TYPES) must list every tag it
/// declares.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Every event type tag the enum decodes.
    const EVENT_TYPES: &'static [&'static str];

    /// Whether `event_type` is one of this enum's tags.
    fn handles(event_type: &str) -> bool {
        Self::EVENT_TYPES.contains(&event_type)
    }
}

/// Decode a committed event into a domain event enum.
///
/// # Returns
///
/// `Ok(None)` when the event type is not one of `E`'s tags.
///
/// # Errors
///
/// Returns `serde_json::Error` when the tag is known but the payload does
/// not match its variant.
pub fn decode_domain_event<E: DomainEvent>(event: &Event) -> serde_json::Result<Option<E>> {
    if !E::handles(&event.event_type) {
        return Ok(None);
    }
    let tagged = if event.payload.is_null() {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({
            "type": event.event_type,
            "data": event.payload,
        })
    };
    serde_json::from_value(tagged).map(Some)
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A committed event with fixed metadata, for reducer and fold tests.
    pub(crate) fn committed(
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: Value,
        sequence: u64,
    ) -> Event {
        Event {
            instance_id: "inst-1".to_string(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_version: sequence,
            sequence,
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload,
            creation_date: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default(),
            editor_id: Some("editor-1".to_string()),
            resource_owner: aggregate_id.to_string(),
            correlation_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::committed;
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum SampleEvent {
        #[serde(rename = "sample.added")]
        Added { name: String },
        #[serde(rename = "sample.removed")]
        Removed,
    }

    impl DomainEvent for SampleEvent {
        const EVENT_TYPES: &'static [&'static str] = &["sample.added", "sample.removed"];
    }

    #[test]
    fn encode_splits_tag_and_payload() {
        let ctx = CommandContext::new("inst-1")
            .with_editor("user-1")
            .with_correlation_id("req-1");
        let proposed = encode_domain_event(
            &SampleEvent::Added {
                name: "a".to_string(),
            },
            &ctx,
        )
        .expect("encode");

        assert_eq!(proposed.event_type, "sample.added");
        assert_eq!(proposed.payload, serde_json::json!({"name": "a"}));
        assert_eq!(proposed.editor_id.as_deref(), Some("user-1"));
        assert_eq!(proposed.correlation_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn encode_fieldless_variant_has_null_payload() {
        let proposed = encode_domain_event(&SampleEvent::Removed, &CommandContext::new("inst-1"))
            .expect("encode");
        assert_eq!(proposed.event_type, "sample.removed");
        assert!(proposed.payload.is_null());
    }

    #[test]
    fn encode_rejects_untagged_values() {
        let err = encode_domain_event(&42u32, &CommandContext::new("inst-1"));
        assert!(err.is_err());
    }

    #[test]
    fn decode_known_and_fieldless_events() {
        let added = committed(
            "sample",
            "s-1",
            "sample.added",
            serde_json::json!({"name": "x"}),
            1,
        );
        assert_eq!(
            decode_domain_event::<SampleEvent>(&added).expect("decode"),
            Some(SampleEvent::Added {
                name: "x".to_string()
            })
        );

        let removed = committed("sample", "s-1", "sample.removed", Value::Null, 2);
        assert_eq!(
            decode_domain_event::<SampleEvent>(&removed).expect("decode"),
            Some(SampleEvent::Removed)
        );
    }

    #[test]
    fn decode_unknown_type_is_none() {
        let event = committed("sample", "s-1", "sample.renamed", serde_json::json!({}), 1);
        assert_eq!(
            decode_domain_event::<SampleEvent>(&event).expect("decode"),
            None
        );
    }

    #[test]
    fn decode_known_type_with_bad_payload_is_an_error() {
        let event = committed(
            "sample",
            "s-1",
            "sample.added",
            serde_json::json!({"name": 42}),
            1,
        );
        assert!(decode_domain_event::<SampleEvent>(&event).is_err());
    }

    #[test]
    fn payload_as_accepts_null_for_optional_fields() {
        #[derive(Debug, Default, Deserialize)]
        struct Optional {
            name: Option<String>,
        }
        let event = committed("sample", "s-1", "sample.removed", Value::Null, 1);
        let decoded: Optional = event.payload_as().expect("decode");
        assert!(decoded.name.is_none());
    }
}
