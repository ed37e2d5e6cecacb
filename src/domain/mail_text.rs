//! Organization mail text policy, keyed by `(mail_text_type, language)`.
//!
//! The texts live on the org aggregate. Several texts share one aggregate,
//! so the write model folds only the events of its own key while the
//! aggregate version it tracks covers them all.

use serde::{Deserialize, Serialize};

use super::{ORG_AGGREGATE_TYPE, require};
use crate::command::{CommandContext, Commands, Committed, ObjectDetails};
use crate::error::CommandError;
use crate::event::DomainEvent;
use crate::write_model::{PolicyState, WriteModel, WriteModelBase};

/// A mail text as submitted and returned by the commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailText {
    /// Which mail the text is for (e.g. `"InitCode"`).
    pub mail_text_type: String,
    /// Language tag (e.g. `"en"`).
    pub language: String,
    /// Heading shown at the top of the mail.
    pub title: String,
    /// Preview line mail clients show after the subject.
    pub pre_header: String,
    /// Subject line.
    pub subject: String,
    /// Salutation; may contain template placeholders.
    pub greeting: String,
    /// Body text.
    pub text: String,
    /// Label of the call-to-action button.
    pub button_text: String,
}

impl MailText {
    /// Whether the key fields are present.
    pub fn is_valid(&self) -> bool {
        !self.mail_text_type.trim().is_empty() && !self.language.trim().is_empty()
    }
}

/// Key of a mail text within its org.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailTextKey {
    /// Which mail the text is for.
    pub mail_text_type: String,
    /// Language tag.
    pub language: String,
}

/// Changed fields of a mail text. Unchanged fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailTextChanges {
    /// Which mail the changed text is for.
    pub mail_text_type: String,
    /// Language tag of the changed text.
    pub language: String,
    /// New title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New preview line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_header: Option<String>,
    /// New subject line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// New salutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    /// New body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// New button label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
}

impl MailTextChanges {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.pre_header.is_none()
            && self.subject.is_none()
            && self.greeting.is_none()
            && self.text.is_none()
            && self.button_text.is_none()
    }
}

/// Events of the mail text policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MailTextEvent {
    /// A text was added for a new key.
    #[serde(rename = "org.policy.mail.text.added")]
    Added(MailText),
    /// Fields of an existing text changed.
    #[serde(rename = "org.policy.mail.text.changed")]
    Changed(MailTextChanges),
    /// The text of a key was removed.
    #[serde(rename = "org.policy.mail.text.removed")]
    Removed(MailTextKey),
}

impl DomainEvent for MailTextEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "org.policy.mail.text.added",
        "org.policy.mail.text.changed",
        "org.policy.mail.text.removed",
    ];
}

/// Write model of one mail text.
#[derive(Debug, Clone, PartialEq)]
pub struct MailTextWriteModel {
    base: WriteModelBase,
    /// Lifecycle of this key.
    pub state: PolicyState,
    /// Current text; only meaningful while `state` is active.
    pub mail_text: MailText,
}

impl MailTextWriteModel {
    /// Empty model for `(mail_text_type, language)` on `org_id`.
    pub fn new(instance_id: &str, org_id: &str, mail_text_type: &str, language: &str) -> Self {
        Self {
            base: WriteModelBase::new(instance_id, org_id, org_id),
            state: PolicyState::Unspecified,
            mail_text: MailText {
                mail_text_type: mail_text_type.to_string(),
                language: language.to_string(),
                ..MailText::default()
            },
        }
    }

    fn is_own_key(&self, mail_text_type: &str, language: &str) -> bool {
        self.mail_text.mail_text_type == mail_text_type && self.mail_text.language == language
    }

    /// The change event that would turn the current text into `requested`,
    /// or `None` if nothing differs.
    pub fn changed_event(&self, requested: &MailText) -> Option<MailTextEvent> {
        let current = &self.mail_text;
        let differs = |now: &String, wanted: &String| (now != wanted).then(|| wanted.clone());
        let changes = MailTextChanges {
            mail_text_type: current.mail_text_type.clone(),
            language: current.language.clone(),
            title: differs(&current.title, &requested.title),
            pre_header: differs(&current.pre_header, &requested.pre_header),
            subject: differs(&current.subject, &requested.subject),
            greeting: differs(&current.greeting, &requested.greeting),
            text: differs(&current.text, &requested.text),
            button_text: differs(&current.button_text, &requested.button_text),
        };
        (!changes.is_empty()).then_some(MailTextEvent::Changed(changes))
    }
}

impl WriteModel for MailTextWriteModel {
    const AGGREGATE_TYPE: &'static str = ORG_AGGREGATE_TYPE;
    type Event = MailTextEvent;

    fn base(&self) -> &WriteModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WriteModelBase {
        &mut self.base
    }

    fn apply(&mut self, event: &MailTextEvent) {
        match event {
            MailTextEvent::Added(added) => {
                if self.is_own_key(&added.mail_text_type, &added.language) {
                    self.mail_text = added.clone();
                    self.state = PolicyState::Active;
                }
            }
            MailTextEvent::Changed(changes) => {
                if !self.is_own_key(&changes.mail_text_type, &changes.language) {
                    return;
                }
                let text = &mut self.mail_text;
                let fields = [
                    (&mut text.title, &changes.title),
                    (&mut text.pre_header, &changes.pre_header),
                    (&mut text.subject, &changes.subject),
                    (&mut text.greeting, &changes.greeting),
                    (&mut text.text, &changes.text),
                    (&mut text.button_text, &changes.button_text),
                ];
                for (field, change) in fields {
                    if let Some(value) = change {
                        field.clone_from(value);
                    }
                }
            }
            MailTextEvent::Removed(key) => {
                if self.is_own_key(&key.mail_text_type, &key.language) {
                    self.mail_text = MailText {
                        mail_text_type: key.mail_text_type.clone(),
                        language: key.language.clone(),
                        ..MailText::default()
                    };
                    self.state = PolicyState::Removed;
                }
            }
        }
    }
}

fn not_found(org_id: &str, mail_text_type: &str, language: &str) -> CommandError {
    CommandError::NotFound(format!("mail text {mail_text_type}/{language} of org {org_id}"))
}

impl Commands {
    /// Add a mail text to an org.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the org id, type or language is
    ///   missing.
    /// * [`CommandError::AlreadyExists`] if the key is active.
    pub async fn add_mail_text(
        &self,
        ctx: &CommandContext,
        org_id: &str,
        mail_text: &MailText,
    ) -> Result<Committed<MailText>, CommandError> {
        ctx.validate()?;
        require("resource owner", org_id)?;
        if !mail_text.is_valid() {
            return Err(CommandError::invalid("mail text type and language are required"));
        }

        self.retry_on_conflict("add_mail_text", move || async move {
            let mut model = MailTextWriteModel::new(
                &ctx.instance_id,
                org_id,
                &mail_text.mail_text_type,
                &mail_text.language,
            );
            self.fill(&mut model).await?;
            if model.state.exists() {
                return Err(CommandError::AlreadyExists(format!(
                    "mail text {}/{} of org {org_id}",
                    mail_text.mail_text_type, mail_text.language
                )));
            }

            self.push(&mut model, &[MailTextEvent::Added(mail_text.clone())], ctx)
                .await?;
            Ok(Committed {
                details: ObjectDetails::from_base(model.base()),
                value: model.mail_text,
            })
        })
        .await
    }

    /// Change an active mail text.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the org id, type or language is
    ///   missing.
    /// * [`CommandError::NotFound`] if the key is not active.
    /// * [`CommandError::PreconditionFailed`] if no field differs; nothing
    ///   is appended.
    pub async fn change_mail_text(
        &self,
        ctx: &CommandContext,
        org_id: &str,
        mail_text: &MailText,
    ) -> Result<Committed<MailText>, CommandError> {
        ctx.validate()?;
        require("resource owner", org_id)?;
        if !mail_text.is_valid() {
            return Err(CommandError::invalid("mail text type and language are required"));
        }

        self.retry_on_conflict("change_mail_text", move || async move {
            let mut model = MailTextWriteModel::new(
                &ctx.instance_id,
                org_id,
                &mail_text.mail_text_type,
                &mail_text.language,
            );
            self.fill(&mut model).await?;
            if !model.state.exists() {
                return Err(not_found(org_id, &mail_text.mail_text_type, &mail_text.language));
            }
            let Some(changed) = model.changed_event(mail_text) else {
                return Err(CommandError::PreconditionFailed("mail text has not changed".into()));
            };

            self.push(&mut model, &[changed], ctx).await?;
            Ok(Committed {
                details: ObjectDetails::from_base(model.base()),
                value: model.mail_text,
            })
        })
        .await
    }

    /// Remove an active mail text. The key can be added again afterwards.
    ///
    /// # Errors
    ///
    /// * [`CommandError::InvalidArgument`] if the org id, type or language is
    ///   missing.
    /// * [`CommandError::NotFound`] if the key is not active.
    pub async fn remove_mail_text(
        &self,
        ctx: &CommandContext,
        org_id: &str,
        mail_text_type: &str,
        language: &str,
    ) -> Result<ObjectDetails, CommandError> {
        ctx.validate()?;
        require("resource owner", org_id)?;
        require("mail text type", mail_text_type)?;
        require("language", language)?;

        self.retry_on_conflict("remove_mail_text", move || async move {
            let mut model =
                MailTextWriteModel::new(&ctx.instance_id, org_id, mail_text_type, language);
            self.fill(&mut model).await?;
            if !model.state.exists() {
                return Err(not_found(org_id, mail_text_type, language));
            }

            let removed = MailTextEvent::Removed(MailTextKey {
                mail_text_type: mail_text_type.to_string(),
                language: language.to_string(),
            });
            self.push(&mut model, &[removed], ctx).await?;
            Ok(ObjectDetails::from_base(model.base()))
        })
        .await
    }
}
