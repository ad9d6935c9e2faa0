use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ===== Automations =====

/// Domain events that can enroll a contact into an automation
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_trigger", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ContactCreated,
    TicketPurchased,
    CheckedIn,
    TagAdded,
    ConsentGiven,
    ScheduledDate,
    TalkSubmitted,
    TalkAccepted,
    TalkRejected,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactCreated => "contact_created",
            Self::TicketPurchased => "ticket_purchased",
            Self::CheckedIn => "checked_in",
            Self::TagAdded => "tag_added",
            Self::ConsentGiven => "consent_given",
            Self::ScheduledDate => "scheduled_date",
            Self::TalkSubmitted => "talk_submitted",
            Self::TalkAccepted => "talk_accepted",
            Self::TalkRejected => "talk_rejected",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Owning event scope; `None` means the automation listens to every event
    pub event_id: Option<Uuid>,
    pub edition_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub trigger_config: serde_json::Value,
    pub status: AutomationStatus,
    pub start_step_id: Option<Uuid>,
    pub enrollment_count: i64,
    pub completed_count: i64,
    /// Bumped whenever the trigger or step set changes
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ===== Steps =====

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_step_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendEmail,
    Wait,
    Condition,
    AddTag,
    RemoveTag,
    UpdateField,
    Webhook,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::Wait => "wait",
            Self::Condition => "condition",
            Self::AddTag => "add_tag",
            Self::RemoveTag => "remove_tag",
            Self::UpdateField => "update_field",
            Self::Webhook => "webhook",
        }
    }

    /// Steps whose side effect crosses the network and goes through retries
    pub fn is_network(&self) -> bool {
        matches!(self, Self::SendEmail | Self::Webhook)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of an automation graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: Uuid,
    pub automation_id: Uuid,
    /// Display ordering only
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub next_step_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum StepKind {
    SendEmail(SendEmailConfig),
    Wait(WaitConfig),
    Condition(ConditionConfig),
    AddTag(TagConfig),
    RemoveTag(TagConfig),
    UpdateField(UpdateFieldConfig),
    Webhook(WebhookConfig),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::SendEmail(_) => StepType::SendEmail,
            Self::Wait(_) => StepType::Wait,
            Self::Condition(_) => StepType::Condition,
            Self::AddTag(_) => StepType::AddTag,
            Self::RemoveTag(_) => StepType::RemoveTag,
            Self::UpdateField(_) => StepType::UpdateField,
            Self::Webhook(_) => StepType::Webhook,
        }
    }

    /// Split into the `(type, config)` column pair used for storage
    pub fn to_parts(&self) -> Result<(StepType, serde_json::Value), serde_json::Error> {
        let value = serde_json::to_value(self)?;
        let config = value.get("config").cloned().unwrap_or(serde_json::Value::Null);
        Ok((self.step_type(), config))
    }

    pub fn from_parts(step_type: StepType, config: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": step_type.as_str(),
            "config": config,
        }))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SendEmailConfig {
    /// Stored template; takes precedence over inline content
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub text_body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WaitConfig {
    #[serde(default)]
    pub delay: Option<WaitDelay>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WaitDelay {
    pub amount: u32,
    pub unit: DelayUnit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl WaitDelay {
    /// Longest wait an automation may declare
    pub const MAX_DAYS: i64 = 3650;

    pub fn to_duration(&self) -> Option<chrono::Duration> {
        let amount = i64::from(self.amount);
        match self.unit {
            DelayUnit::Minutes => chrono::Duration::try_minutes(amount),
            DelayUnit::Hours => chrono::Duration::try_hours(amount),
            DelayUnit::Days => chrono::Duration::try_days(amount),
        }
    }

    /// `from + delay`, or None when the result is not representable
    pub fn after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.to_duration()?)
    }

    pub fn exceeds_max(&self) -> bool {
        self.to_duration()
            .is_none_or(|duration| duration > chrono::Duration::days(Self::MAX_DAYS))
    }
}

/// Closed operator set for condition steps
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    IsSet,
    IsNotSet,
}

impl ConditionOperator {
    pub fn needs_value(&self) -> bool {
        !matches!(self, Self::IsSet | Self::IsNotSet)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionConfig {
    /// Dotted path into the contact snapshot, e.g. `tags` or `fields.company`
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub on_true: BranchTarget,
    #[serde(default)]
    pub on_false: BranchTarget,
}

/// Where a condition sends the enrollment next
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BranchTarget {
    Goto { step_id: Uuid },
    Exit {
        #[serde(default)]
        reason: Option<String>,
    },
    #[default]
    Complete,
}

impl BranchTarget {
    pub fn step_id(&self) -> Option<Uuid> {
        match self {
            Self::Goto { step_id } => Some(*step_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagConfig {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateFieldConfig {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldValue {
    Literal { value: serde_json::Value },
    /// `{{path}}` placeholders resolved against the contact and enrollment
    Template { template: String },
    Now,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Static payload merged into the outbound body under `data`
    #[serde(default)]
    pub data: serde_json::Value,
}

// ===== Enrollments =====

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "enrollment_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
    Failed,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub contact_id: Uuid,
    /// Step the enrollment is positioned on; `None` until the entry step runs
    pub current_step_id: Option<Uuid>,
    pub status: EnrollmentStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub wait_until: Option<DateTime<Utc>>,
    /// Count of committed transitions, scopes idempotency keys per visit
    pub sequence: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn new(automation_id: Uuid, contact_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            contact_id,
            current_step_id: None,
            status: EnrollmentStatus::Active,
            started_at: now,
            completed_at: None,
            exited_at: None,
            exit_reason: None,
            wait_until: None,
            sequence: 0,
            lease_owner: None,
            lease_expires_at: None,
            updated_at: None,
        }
    }

    /// Active and not parked past `now`
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active && self.wait_until.is_none_or(|until| until <= now)
    }

    pub fn lease_is_free(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_none_or(|expires| expires <= now)
    }
}

// ===== Execution log =====

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_log_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub enrollment_id: Uuid,
    pub contact_id: Uuid,
    pub step_id: Uuid,
    pub step_type: Option<StepType>,
    pub sequence: i32,
    pub attempt: i32,
    pub status: LogStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}
