//! The `features` read model: one row per org override and one per
//! instance default, told apart by `is_default`.

use crate::domain::features::FeaturesSet;
use crate::domain::{INSTANCE_AGGREGATE_TYPE, ORG_AGGREGATE_TYPE};
use crate::event::Event;
use crate::projection::{AggregateReducer, EventReducer, Projection, ReduceError, decode_payload};
use crate::statement::{Column, Statement};

use super::instance_column;

/// Table name.
pub const FEATURES_TABLE: &str = "features";

/// Column names.
pub const AGGREGATE_ID: &str = "aggregate_id";
pub const CHANGE_DATE: &str = "change_date";
pub const SEQUENCE: &str = "sequence";
pub const IS_DEFAULT: &str = "is_default";
pub const STATE: &str = "state";

/// Event types handled.
pub const FEATURES_SET: &str = "features.set";
pub const FEATURES_REMOVED: &str = "features.removed";

/// Projection of feature sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeaturesProjection;

impl Projection for FeaturesProjection {
    const NAME: &'static str = "projections.features";

    const SCHEMA: &'static str = r"
CREATE TABLE IF NOT EXISTS features (
    instance_id                 TEXT    NOT NULL,
    aggregate_id                TEXT    NOT NULL,
    change_date                 INTEGER NOT NULL,
    sequence                    INTEGER NOT NULL,
    is_default                  INTEGER NOT NULL,
    tier_name                   TEXT    NOT NULL DEFAULT '',
    tier_description            TEXT    NOT NULL DEFAULT '',
    state                       INTEGER NOT NULL DEFAULT 0,
    state_description           TEXT    NOT NULL DEFAULT '',
    audit_log_retention_secs    INTEGER NOT NULL DEFAULT 0,
    login_policy_factors        INTEGER NOT NULL DEFAULT 0,
    login_policy_idp            INTEGER NOT NULL DEFAULT 0,
    login_policy_passwordless   INTEGER NOT NULL DEFAULT 0,
    login_policy_registration   INTEGER NOT NULL DEFAULT 0,
    login_policy_username_login INTEGER NOT NULL DEFAULT 0,
    login_policy_password_reset INTEGER NOT NULL DEFAULT 0,
    password_complexity_policy  INTEGER NOT NULL DEFAULT 0,
    label_policy_private_label  INTEGER NOT NULL DEFAULT 0,
    label_policy_watermark      INTEGER NOT NULL DEFAULT 0,
    custom_domain               INTEGER NOT NULL DEFAULT 0,
    privacy_policy              INTEGER NOT NULL DEFAULT 0,
    metadata_user               INTEGER NOT NULL DEFAULT 0,
    custom_text_message         INTEGER NOT NULL DEFAULT 0,
    custom_text_login           INTEGER NOT NULL DEFAULT 0,
    lockout_policy              INTEGER NOT NULL DEFAULT 0,
    actions                     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (instance_id, aggregate_id)
);
";

    fn reducers() -> Vec<AggregateReducer> {
        let reducers = vec![
            EventReducer {
                event_type: FEATURES_SET,
                reduce: reduce_features_set,
            },
            EventReducer {
                event_type: FEATURES_REMOVED,
                reduce: reduce_features_removed,
            },
        ];
        vec![
            AggregateReducer {
                aggregate_type: ORG_AGGREGATE_TYPE,
                event_reducers: reducers.clone(),
            },
            AggregateReducer {
                aggregate_type: INSTANCE_AGGREGATE_TYPE,
                event_reducers: reducers,
            },
        ]
    }
}

fn key(event: &Event) -> Vec<Column> {
    vec![
        instance_column(&event.instance_id),
        Column::new(AGGREGATE_ID, event.aggregate_id.clone()),
    ]
}

/// Upsert the changed fields. `is_default` comes from the aggregate type
/// alone: the instance aggregate holds the default.
fn reduce_features_set(event: &Event) -> Result<Vec<Statement>, ReduceError> {
    let set: FeaturesSet = decode_payload(event)?;

    let mut columns = vec![
        Column::new(CHANGE_DATE, event.creation_date),
        Column::new(SEQUENCE, event.sequence),
        Column::new(IS_DEFAULT, event.aggregate_type == INSTANCE_AGGREGATE_TYPE),
    ];
    if let Some(state) = set.state {
        columns.push(Column::new(STATE, state.code()));
    }
    macro_rules! changed_columns {
        ($($field:ident),*) => {
            $(if let Some(value) = set.$field {
                columns.push(Column::new(stringify!($field), value));
            })*
        };
    }
    changed_columns!(
        tier_name,
        tier_description,
        state_description,
        audit_log_retention_secs,
        login_policy_factors,
        login_policy_idp,
        login_policy_passwordless,
        login_policy_registration,
        login_policy_username_login,
        login_policy_password_reset,
        password_complexity_policy,
        label_policy_private_label,
        label_policy_watermark,
        custom_domain,
        privacy_policy,
        metadata_user,
        custom_text_message,
        custom_text_login,
        lockout_policy,
        actions
    );

    Ok(vec![Statement::Upsert {
        table: FEATURES_TABLE,
        key: key(event),
        columns,
    }])
}

/// Delete the row of the aggregate. The payload is not read.
fn reduce_features_removed(event: &Event) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![Statement::Delete {
        table: FEATURES_TABLE,
        key: key(event),
    }])
}
