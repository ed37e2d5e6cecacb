//! Usage quotas on the instance aggregate, one per unit.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::INSTANCE_AGGREGATE_TYPE;
use crate::command::{CommandContext, Commands, Committed, ObjectDetails};
use crate::error::CommandError;
use crate::event::DomainEvent;
use crate::write_model::{PolicyState, WriteModel, WriteModelBase};

/// What a quota counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaUnit {
    /// Authenticated API requests.
    RequestsAllAuthenticated,
    /// Seconds spent running actions.
    ActionsAllRunsSeconds,
}

impl QuotaUnit {
    /// Stable name used in events and read-model keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestsAllAuthenticated => "requests_all_authenticated",
            Self::ActionsAllRunsSeconds => "actions_all_runs_seconds",
        }
    }
}

impl fmt::Display for QuotaUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quota: `amount` units per `interval`, counted in periods starting at
/// `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// What is counted.
    pub unit: QuotaUnit,
    /// Start of the first period.
    pub from: DateTime<Utc>,
    /// Length of each period.
    pub interval: Duration,
    /// Units allowed per period.
    pub amount: u64,
    /// Whether exceeding the amount is enforced.
    pub limit: bool,
}

impl Quota {
    /// Period length in milliseconds, saturating.
    pub fn interval_millis(&self) -> i64 {
        i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX)
    }

    /// Start of the period containing `now`. Before `from`, that is `from`.
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval_millis();
        let elapsed = (now - self.from).num_milliseconds();
        if interval <= 0 || elapsed <= 0 {
            return self.from;
        }
        let offset = (elapsed / interval).saturating_mul(interval);
        self.from
            .checked_add_signed(TimeDelta::milliseconds(offset))
            .unwrap_or(self.from)
    }
}

/// Payload of `quota.removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRemoved {
    /// Unit whose quota was removed.
    pub unit: QuotaUnit,
}

/// Events of the quota aggregate slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QuotaEvent {
    /// A quota was set for a unit.
    #[serde(rename = "quota.added")]
    Added(Quota),
    /// The quota of a unit was removed.
    #[serde(rename = "quota.removed")]
    Removed(QuotaRemoved),
}

impl DomainEvent for QuotaEvent {
    const EVENT_TYPES: &'static [&'static str] = &["quota.added", "quota.removed"];
}

/// Write model of the quota for one unit.
#[derive(Debug, Clone)]
pub struct QuotaWriteModel {
    base: WriteModelBase,
    unit: QuotaUnit,
    /// Lifecycle of the quota for this unit.
    pub state: PolicyState,
    /// Current quota; `None` unless active.
    pub quota: Option<Quota>,
}

impl QuotaWriteModel {
    /// Empty model for `unit` on `instance_id`.
    pub fn new(instance_id: &str, unit: QuotaUnit) -> Self {
        Self {
            base: WriteModelBase::new(instance_id, instance_id, instance_id),
            unit,
            state: PolicyState::Unspecified,
            quota: None,
        }
    }
}

impl WriteModel for QuotaWriteModel {
    const AGGREGATE_TYPE: &'static str = INSTANCE_AGGREGATE_TYPE;
    type Event = QuotaEvent;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn apply(&mut self, event: &QuotaEvent) {
        match event {
            QuotaEvent::Added(quota) if quota.unit == self.unit => {
                self.quota = Some(quota.clone());
                self.state = PolicyState::Active;
            }
            QuotaEvent::Removed(removed) if removed.unit == self.unit => {
                self.quota = None;
                self.state = PolicyState::Removed;
            }
            _ => {}
        }
    }
}

impl Commands {
    /// Add the quota for `quota.unit` to the context's instance.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the amount or interval is zero.
    /// * [`CommandError::AlreadyExists`] if the unit already has a quota.
    pub async fn add_quota(
        &self,
        ctx: &CommandContext,
        quota: &Quota,
    ) -> Result<Committed<Quota>, CommandError> {
        ctx.validate()?;
        if quota.amount == 0 {
            return Err(CommandError::invalid("quota amount must be positive"));
        }
        if quota.interval.is_zero() {
            return Err(CommandError::invalid("quota interval must be positive"));
        }

        self.retry_on_conflict("add_quota", move || async move {
            let mut model = QuotaWriteModel::new(&ctx.instance_id, quota.unit);
            self.fill(&mut model).await?;
            if model.state.exists() {
                return Err(CommandError::AlreadyExists(format!("quota for unit {}", quota.unit)));
            }
            self.push(&mut model, &[QuotaEvent::Added(quota.clone())], ctx)
                .await?;
            Ok(Committed {
                details: ObjectDetails::from_base(model.base()),
                value: quota.clone(),
            })
        })
        .await
    }

    /// Remove the quota for `unit` from the context's instance.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotFound`] if the unit has no quota.
    pub async fn remove_quota(
        &self,
        ctx: &CommandContext,
        unit: QuotaUnit,
    ) -> Result<ObjectDetails, CommandError> {
        ctx.validate()?;

        self.retry_on_conflict("remove_quota", move || async move {
            let mut model = QuotaWriteModel::new(&ctx.instance_id, unit);
            self.fill(&mut model).await?;
            if !model.state.exists() {
                return Err(CommandError::NotFound(format!("quota for unit {unit}")));
            }
            self.push(
                &mut model,
                &[QuotaEvent::Removed(QuotaRemoved { unit })],
                ctx,
            )
            .await?;
            Ok(ObjectDetails::from_base(model.base()))
        })
        .await
    }
}
