// Step executor - one dispatch per step kind, producing the enrollment's next move

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use cadence_shared::{
    BranchTarget, ConditionConfig, Enrollment, FieldValue, SendEmailConfig, Step, StepKind, TagConfig,
    UpdateFieldConfig, WaitConfig, WebhookConfig,
};

use super::conditions::ConditionEvaluator;
use super::retry::{RetryCoordinator, RetryOutcome};
use super::store::StoreError;
use super::templates::{render_context, render_str, render_value};
use crate::services::{
    ContactSnapshot, ContactStore, ContactStoreError, EmailContent, EmailTransport, WebhookClient,
    WebhookRequest, WebhookSigner,
};

/// What the enrollment does after a step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Move to the given step, or complete when `None`
    Advance { next_step_id: Option<Uuid> },
    Wait { until: DateTime<Utc> },
    Exit { reason: String },
    Fail { error: String },
}

impl StepOutcome {
    pub fn advance(next_step_id: Option<Uuid>) -> Self {
        Self::Advance { next_step_id }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail { error: error.into() }
    }
}

/// Outcome plus what should be written to the execution log for it
#[derive(Debug, Clone)]
pub struct StepReport {
    pub outcome: StepOutcome,
    pub input: Value,
    pub output: Option<Value>,
    /// Attempt rows were already written by the retry coordinator
    pub logged: bool,
}

impl StepReport {
    fn new(outcome: StepOutcome, input: Value) -> Self {
        Self { outcome, input, output: None, logged: false }
    }

    fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    fn logged(mut self) -> Self {
        self.logged = true;
        self
    }
}

/// Errors that abort the step without deciding the enrollment's fate.
/// The lease is released and the step runs again on a later pass.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Contact store unavailable: {0}")]
    Contacts(ContactStoreError),
}

pub struct StepExecutor {
    contacts: Arc<dyn ContactStore>,
    email: Arc<dyn EmailTransport>,
    webhooks: Arc<dyn WebhookClient>,
    signer: WebhookSigner,
    retry: RetryCoordinator,
}

impl StepExecutor {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        email: Arc<dyn EmailTransport>,
        webhooks: Arc<dyn WebhookClient>,
        signer: WebhookSigner,
        retry: RetryCoordinator,
    ) -> Self {
        Self { contacts, email, webhooks, signer, retry }
    }

    pub fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    /// Key stable across retries and crash-resumes of one visit of a step
    pub fn idempotency_key(enrollment: &Enrollment, step: &Step) -> String {
        format!("{}:{}:{}", enrollment.id, step.id, enrollment.sequence)
    }

    pub async fn execute(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        contact: &ContactSnapshot,
        now: DateTime<Utc>,
    ) -> Result<StepReport, ExecutorError> {
        debug!("Executing {} step {} for enrollment {}", step.step_type(), step.id, enrollment.id);

        match &step.kind {
            StepKind::SendEmail(config) => self.send_email(enrollment, step, contact, config).await,
            StepKind::Wait(config) => Ok(Self::wait(config, now)),
            StepKind::Condition(config) => Ok(Self::condition(config, contact)),
            StepKind::AddTag(config) => self.add_tag(step, contact, config).await,
            StepKind::RemoveTag(config) => self.remove_tag(step, contact, config).await,
            StepKind::UpdateField(config) => self.update_field(enrollment, step, contact, config, now).await,
            StepKind::Webhook(config) => self.webhook(enrollment, step, contact, config, now).await,
        }
    }

    async fn send_email(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        contact: &ContactSnapshot,
        config: &SendEmailConfig,
    ) -> Result<StepReport, ExecutorError> {
        let context = render_context(contact, enrollment);
        let content = match &config.template_id {
            Some(template_id) if !template_id.trim().is_empty() => {
                let mut variables = context.clone();
                if let (Value::Object(vars), Value::Object(extra)) =
                    (&mut variables, render_value(&config.variables, &context))
                {
                    vars.extend(extra);
                }
                EmailContent::Template { template_id: template_id.clone(), variables }
            }
            _ => EmailContent::Inline {
                subject: render_str(config.subject.as_deref().unwrap_or_default(), &context),
                html_body: render_str(config.html_body.as_deref().unwrap_or_default(), &context),
                text_body: config.text_body.as_deref().map(|t| render_str(t, &context)),
            },
        };

        let Some(to) = contact.email.clone().filter(|e| !e.trim().is_empty()) else {
            return Ok(StepReport::new(
                StepOutcome::fail(format!("contact {} has no email address", contact.id)),
                json!({ "template_id": config.template_id }),
            ));
        };

        let key = Self::idempotency_key(enrollment, step);
        let input = json!({
            "to": to,
            "template_id": config.template_id,
            "subject": match &content {
                EmailContent::Inline { subject, .. } => Some(subject.clone()),
                EmailContent::Template { .. } => None,
            },
            "idempotency_key": key,
        });

        let email = self.email.clone();
        let outcome = self
            .retry
            .run(enrollment, step, &input, |_attempt| {
                let email = email.clone();
                let to = to.clone();
                let content = content.clone();
                let key = key.clone();
                async move {
                    email.send(&to, &content, &key).await?;
                    Ok(json!({ "sent_to": to }))
                }
            })
            .await?;

        Ok(Self::from_retry(outcome, step, input))
    }

    fn wait(config: &WaitConfig, now: DateTime<Utc>) -> StepReport {
        let until = match (&config.delay, config.until) {
            (Some(delay), _) => match delay.after(now) {
                Some(until) => until,
                None => {
                    return StepReport::new(
                        StepOutcome::fail(format!("wait of {} {:?} is out of range", delay.amount, delay.unit)),
                        json!({ "entered_at": now, "delay": delay }),
                    );
                }
            },
            (None, Some(until)) => until,
            (None, None) => now,
        };
        StepReport::new(StepOutcome::Wait { until }, json!({ "entered_at": now }))
            .with_output(json!({ "wait_until": until }))
    }

    fn condition(config: &ConditionConfig, contact: &ContactSnapshot) -> StepReport {
        let document = contact.to_document();
        let input = json!({
            "field": config.field,
            "operator": config.operator,
            "value": config.value,
        });

        match ConditionEvaluator::evaluate(config, &document) {
            Ok(matched) => {
                let branch = if matched { &config.on_true } else { &config.on_false };
                let outcome = match branch {
                    BranchTarget::Goto { step_id } => StepOutcome::advance(Some(*step_id)),
                    BranchTarget::Complete => StepOutcome::advance(None),
                    BranchTarget::Exit { reason } => StepOutcome::Exit {
                        reason: reason.clone().unwrap_or_else(|| {
                            format!("condition on '{}' was {}", config.field, matched)
                        }),
                    },
                };
                StepReport::new(outcome, input).with_output(json!({ "result": matched, "branch": branch }))
            }
            Err(e) => StepReport::new(StepOutcome::fail(e.to_string()), input),
        }
    }

    async fn add_tag(
        &self,
        step: &Step,
        contact: &ContactSnapshot,
        config: &TagConfig,
    ) -> Result<StepReport, ExecutorError> {
        let tag = config.tag.trim();
        let input = json!({ "tag": tag });
        let already = contact.has_tag(tag);
        let outcome = self.contact_write(self.contacts.add_tag(contact.id, tag).await, step)?;
        Ok(StepReport::new(outcome, input).with_output(json!({ "changed": !already })))
    }

    async fn remove_tag(
        &self,
        step: &Step,
        contact: &ContactSnapshot,
        config: &TagConfig,
    ) -> Result<StepReport, ExecutorError> {
        let tag = config.tag.trim();
        let input = json!({ "tag": tag });
        let present = contact.has_tag(tag);
        let outcome = self.contact_write(self.contacts.remove_tag(contact.id, tag).await, step)?;
        Ok(StepReport::new(outcome, input).with_output(json!({ "changed": present })))
    }

    async fn update_field(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        contact: &ContactSnapshot,
        config: &UpdateFieldConfig,
        now: DateTime<Utc>,
    ) -> Result<StepReport, ExecutorError> {
        let value = match &config.value {
            FieldValue::Literal { value } => value.clone(),
            FieldValue::Template { template } => {
                Value::String(render_str(template, &render_context(contact, enrollment)))
            }
            FieldValue::Now => json!(now),
        };
        let input = json!({ "field": config.field, "value": value });
        let outcome = self.contact_write(
            self.contacts.update_field(contact.id, &config.field, &value).await,
            step,
        )?;
        Ok(StepReport::new(outcome, input))
    }

    async fn webhook(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        contact: &ContactSnapshot,
        config: &WebhookConfig,
        now: DateTime<Utc>,
    ) -> Result<StepReport, ExecutorError> {
        let key = Self::idempotency_key(enrollment, step);
        let payload = json!({
            "enrollment_id": enrollment.id,
            "automation_id": enrollment.automation_id,
            "contact_id": enrollment.contact_id,
            "step_id": step.id,
            "sequence": enrollment.sequence,
            "sent_at": now,
            "contact": contact,
            "data": config.data,
        });
        let input = json!({ "url": config.url, "idempotency_key": key });

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => return Ok(StepReport::new(StepOutcome::fail(format!("unencodable payload: {}", e)), input)),
        };
        let request = WebhookRequest {
            url: config.url.clone(),
            headers: config.headers.clone(),
            signature: self.signer.sign(&body),
            body,
            idempotency_key: key,
        };

        let webhooks = self.webhooks.clone();
        let outcome = self
            .retry
            .run(enrollment, step, &input, |_attempt| {
                let webhooks = webhooks.clone();
                let request = request.clone();
                async move {
                    let status = webhooks.post(&request).await?;
                    Ok(json!({ "status": status }))
                }
            })
            .await?;

        Ok(Self::from_retry(outcome, step, input))
    }

    fn from_retry(outcome: RetryOutcome, step: &Step, input: Value) -> StepReport {
        match outcome {
            RetryOutcome::Delivered { attempts, output } => {
                info!("Step {} delivered after {} attempt(s)", step.id, attempts);
                StepReport::new(StepOutcome::advance(step.next_step_id), input)
                    .with_output(output)
                    .logged()
            }
            RetryOutcome::AlreadyDone { .. } => {
                StepReport::new(StepOutcome::advance(step.next_step_id), input).logged()
            }
            RetryOutcome::Failed { attempts, error } => StepReport::new(
                StepOutcome::fail(format!("{} (after {} attempt(s))", error.message(), attempts)),
                input,
            )
            .logged(),
        }
    }

    /// Missing contacts and invalid fields end the enrollment; database errors retry later
    fn contact_write(&self, result: Result<(), ContactStoreError>, step: &Step) -> Result<StepOutcome, ExecutorError> {
        match result {
            Ok(()) => Ok(StepOutcome::advance(step.next_step_id)),
            Err(e) if e.is_permanent() => Ok(StepOutcome::fail(e.to_string())),
            Err(e) => Err(ExecutorError::Contacts(e)),
        }
    }
}
