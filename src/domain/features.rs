//! Feature sets: per-org overrides on the org aggregate and the instance
//! default on the instance aggregate.
//!
//! Both scopes share the event types. The projection tells them apart by
//! aggregate type only.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use super::{INSTANCE_AGGREGATE_TYPE, ORG_AGGREGATE_TYPE, require};
use crate::command::{CommandContext, Commands, Committed, ObjectDetails};
use crate::error::CommandError;
use crate::event::DomainEvent;
use crate::write_model::{PolicyState, WriteModel, WriteModelBase};

/// Billing state of a feature set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturesState {
    /// No state recorded.
    #[default]
    Unspecified,
    /// Paid for and in use.
    Active,
    /// Payment or another customer action is outstanding.
    ActionRequired,
    /// Subscription ended.
    Canceled,
    /// Kept on terms no longer offered.
    Grandfathered,
}

impl FeaturesState {
    /// Stable integer code used in read-model columns.
    pub fn code(self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::Active => 1,
            Self::ActionRequired => 2,
            Self::Canceled => 3,
            Self::Grandfathered => 4,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes map to `Unspecified`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Active,
            2 => Self::ActionRequired,
            3 => Self::Canceled,
            4 => Self::Grandfathered,
            _ => Self::Unspecified,
        }
    }
}

/// A complete feature set, as submitted to and returned by the commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Name of the subscribed tier.
    pub tier_name: String,
    /// Free-text description of the tier.
    pub tier_description: String,
    /// Billing state.
    pub state: FeaturesState,
    /// Free-text explanation of the state.
    pub state_description: String,
    /// How long audit events are kept, in seconds.
    pub audit_log_retention_secs: u64,
    /// Custom multi-factor settings in the login policy.
    pub login_policy_factors: bool,
    /// External identity providers in the login policy.
    pub login_policy_idp: bool,
    /// Passwordless login.
    pub login_policy_passwordless: bool,
    /// Self-registration.
    pub login_policy_registration: bool,
    /// Login by username.
    pub login_policy_username_login: bool,
    /// Self-service password reset.
    pub login_policy_password_reset: bool,
    /// Custom password complexity policy.
    pub password_complexity_policy: bool,
    /// Private labeling of the login UI.
    pub label_policy_private_label: bool,
    /// Control over the watermark in the login UI.
    pub label_policy_watermark: bool,
    /// Custom domains.
    pub custom_domain: bool,
    /// Custom privacy policy links.
    pub privacy_policy: bool,
    /// User metadata.
    pub metadata_user: bool,
    /// Custom message texts.
    pub custom_text_message: bool,
    /// Custom login texts.
    pub custom_text_login: bool,
    /// Custom lockout policy.
    pub lockout_policy: bool,
    /// Custom actions.
    pub actions: bool,
}

/// Payload of `features.set`: only the fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesSet {
    /// Changed: name of the subscribed tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_name: Option<String>,
    /// Changed: free-text description of the tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_description: Option<String>,
    /// Changed: billing state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FeaturesState>,
    /// Changed: free-text explanation of the state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_description: Option<String>,
    /// Changed: how long audit events are kept, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_retention_secs: Option<u64>,
    /// Changed: custom multi-factor settings in the login policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_policy_factors: Option<bool>,
    /// Changed: external identity providers in the login policy.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "loginPolicyIDP"
    )]
    pub login_policy_idp: Option<bool>,
    /// Changed: passwordless login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_policy_passwordless: Option<bool>,
    /// Changed: self-registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_policy_registration: Option<bool>,
    /// Changed: login by username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_policy_username_login: Option<bool>,
    /// Changed: self-service password reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_policy_password_reset: Option<bool>,
    /// Changed: custom password complexity policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_complexity_policy: Option<bool>,
    /// Changed: private labeling of the login UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_policy_private_label: Option<bool>,
    /// Changed: control over the watermark in the login UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_policy_watermark: Option<bool>,
    /// Changed: custom domains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<bool>,
    /// Changed: custom privacy policy links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_policy: Option<bool>,
    /// Changed: user metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_user: Option<bool>,
    /// Changed: custom message texts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text_message: Option<bool>,
    /// Changed: custom login texts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text_login: Option<bool>,
    /// Changed: custom lockout policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockout_policy: Option<bool>,
    /// Changed: custom actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<bool>,
}

// Applies `$body` to every field shared by `Features` and `FeaturesSet`.
macro_rules! for_each_feature_field {
    ($body:ident) => {
        $body!(
            tier_name,
            tier_description,
            state,
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
        )
    };
}

impl FeaturesSet {
    /// The fields of `wanted` that differ from `current`.
    pub fn diff(current: &Features, wanted: &Features) -> Self {
        macro_rules! diff {
            ($($field:ident),*) => {
                Self {
                    $($field: (current.$field != wanted.$field).then(|| wanted.$field.clone()),)*
                }
            };
        }
        for_each_feature_field!(diff)
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrite the set fields of `features`.
    pub fn apply_to(&self, features: &mut Features) {
        let set = self;
        macro_rules! apply {
            ($($field:ident),*) => {{
                $(if let Some(value) = &set.$field {
                    features.$field = value.clone();
                })*
            }};
        }
        for_each_feature_field!(apply)
    }
}

/// Events of a feature set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeaturesEvent {
    /// Some fields changed.
    #[serde(rename = "features.set")]
    Set(FeaturesSet),
    /// The feature set was removed.
    #[serde(rename = "features.removed")]
    Removed,
}

impl DomainEvent for FeaturesEvent {
    const EVENT_TYPES: &'static [&'static str] = &["features.set", "features.removed"];
}

/// Which aggregate a feature set lives on.
pub trait FeaturesScope: Send + Sync + 'static {
    /// Aggregate type of the scope.
    const AGGREGATE_TYPE: &'static str;
}

/// Per-org feature overrides.
#[derive(Debug, Clone, Copy)]
pub struct OrgScope;

impl FeaturesScope for OrgScope {
    const AGGREGATE_TYPE: &'static str = ORG_AGGREGATE_TYPE;
}

/// The instance-wide default.
#[derive(Debug, Clone, Copy)]
pub struct InstanceScope;

impl FeaturesScope for InstanceScope {
    const AGGREGATE_TYPE: &'static str = INSTANCE_AGGREGATE_TYPE;
}

/// Write model of one feature set.
#[derive(Debug, Clone)]
pub struct FeaturesWriteModel<S> {
    base: WriteModelBase,
    /// Lifecycle of the feature set.
    pub state: PolicyState,
    /// Current features; only meaningful while `state` is active.
    pub features: Features,
    scope: PhantomData<S>,
}

impl<S: FeaturesScope> FeaturesWriteModel<S> {
    /// Empty model for the feature set on `aggregate_id`.
    pub fn new(instance_id: &str, aggregate_id: &str) -> Self {
        Self {
            base: WriteModelBase::new(instance_id, aggregate_id, aggregate_id),
            state: PolicyState::Unspecified,
            features: Features::default(),
            scope: PhantomData,
        }
    }
}

impl<S: FeaturesScope> WriteModel for FeaturesWriteModel<S> {
    const AGGREGATE_TYPE: &'static str = S::AGGREGATE_TYPE;
    type Event = FeaturesEvent;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn apply(&mut self, event: &FeaturesEvent) {
        match event {
            FeaturesEvent::Set(set) => {
                set.apply_to(&mut self.features);
                self.state = PolicyState::Active;
            }
            FeaturesEvent::Removed => {
                self.features = Features::default();
                self.state = PolicyState::Removed;
            }
        }
    }
}

impl Commands {
    /// Set the feature overrides of an org.
    ///
    /// Only fields that differ from the current set are recorded.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the org id or tier name is
    ///   missing.
    /// * [`CommandError::PreconditionFailed`] if nothing differs.
    pub async fn set_org_features(
        &self,
        ctx: &CommandContext,
        org_id: &str,
        features: &Features,
    ) -> Result<Committed<Features>, CommandError> {
        ctx.validate()?;
        require("resource owner", org_id)?;
        self.set_features::<OrgScope>(ctx, org_id, features).await
    }

    /// Set the instance default feature set.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the tier name is missing.
    /// * [`CommandError::PreconditionFailed`] if nothing differs.
    pub async fn set_default_features(
        &self,
        ctx: &CommandContext,
        features: &Features,
    ) -> Result<Committed<Features>, CommandError> {
        ctx.validate()?;
        self.set_features::<InstanceScope>(ctx, &ctx.instance_id, features)
            .await
    }

    async fn set_features<S: FeaturesScope>(
        &self,
        ctx: &CommandContext,
        aggregate_id: &str,
        features: &Features,
    ) -> Result<Committed<Features>, CommandError> {
        require("tier name", &features.tier_name)?;

        self.retry_on_conflict("set_features", move || async move {
            let mut model = FeaturesWriteModel::<S>::new(&ctx.instance_id, aggregate_id);
            self.fill(&mut model).await?;

            // A removed or never-set model compares against empty features.
            let changes = FeaturesSet::diff(&model.features, features);
            if model.state.exists() && changes.is_empty() {
                return Err(CommandError::PreconditionFailed("features have not changed".into()));
            }

            self.push(&mut model, &[FeaturesEvent::Set(changes)], ctx)
                .await?;
            Ok(Committed {
                details: ObjectDetails::from_base(model.base()),
                value: model.features,
            })
        })
        .await
    }

    /// Remove the feature overrides of an org; the org falls back to the
    /// instance default.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the org id is missing.
    /// * [`CommandError::NotFound`] if the org has no active overrides.
    pub async fn remove_org_features(
        &self,
        ctx: &CommandContext,
        org_id: &str,
    ) -> Result<ObjectDetails, CommandError> {
        ctx.validate()?;
        require("resource owner", org_id)?;

        self.retry_on_conflict("remove_org_features", move || async move {
            let mut model = FeaturesWriteModel::<OrgScope>::new(&ctx.instance_id, org_id);
            self.fill(&mut model).await?;
            if !model.state.exists() {
                return Err(CommandError::NotFound(format!("features of org {org_id}")));
            }
            self.push(&mut model, &[FeaturesEvent::Removed], ctx)
                .await?;
            Ok(ObjectDetails::from_base(model.base()))
        })
        .await
    }
}
