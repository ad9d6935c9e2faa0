// Automation persistence - storage contract shared by the scheduler, triggers and CRUD service

pub mod memory;
pub mod postgres;

pub use memory::MemoryAutomationStore;
pub use postgres::PgAutomationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_shared::{Automation, Enrollment, LogEntry, Step, TriggerType};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// State change produced by executing one step, committed atomically
#[derive(Debug, Clone)]
pub struct Transition {
    /// New enrollment state; lease fields are cleared on commit
    pub enrollment: Enrollment,
    /// Worker that holds the lease; the commit is rejected if it no longer does
    pub lease_owner: Uuid,
    pub log: Option<LogEntry>,
}

/// Filter for execution log queries. At least one id should be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub automation_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl LogQuery {
    pub const DEFAULT_LIMIT: i64 = 200;

    pub fn for_automation(automation_id: Uuid) -> Self {
        Self { automation_id: Some(automation_id), ..Default::default() }
    }

    pub fn for_enrollment(enrollment_id: Uuid) -> Self {
        Self { enrollment_id: Some(enrollment_id), ..Default::default() }
    }

    pub fn for_contact(contact_id: Uuid) -> Self {
        Self { contact_id: Some(contact_id), ..Default::default() }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.automation_id.is_none_or(|id| id == entry.automation_id)
            && self.enrollment_id.is_none_or(|id| id == entry.enrollment_id)
            && self.contact_id.is_none_or(|id| id == entry.contact_id)
    }
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    // ===== Automations =====

    async fn insert_automation(&self, automation: &Automation, steps: &[Step]) -> StoreResult<()>;

    async fn get_automation(&self, id: Uuid) -> StoreResult<Option<Automation>>;

    async fn list_automations(&self) -> StoreResult<Vec<Automation>>;

    /// Persist automation metadata (name, trigger, status, start step, revision)
    async fn update_automation(&self, automation: &Automation) -> StoreResult<()>;

    /// Swap the full step set and the automation row in one transaction
    async fn replace_steps(&self, automation: &Automation, steps: &[Step]) -> StoreResult<()>;

    async fn get_steps(&self, automation_id: Uuid) -> StoreResult<Vec<Step>>;

    async fn active_automations_for_trigger(&self, trigger_type: TriggerType) -> StoreResult<Vec<Automation>>;

    // ===== Enrollments =====

    /// Insert unless the (automation, contact) pair is already enrolled.
    /// Returns `true` when a row was created.
    async fn create_enrollment_if_absent(&self, enrollment: &Enrollment) -> StoreResult<bool>;

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>>;

    async fn list_enrollments(&self, automation_id: Uuid, limit: i64) -> StoreResult<Vec<Enrollment>>;

    /// Active enrollments that may run at `now` on an active automation with no live lease
    async fn runnable_enrollments(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>>;

    /// Take the lease if it is free or expired. `None` means contention or not runnable.
    async fn claim_enrollment(
        &self,
        id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>>;

    async fn release_enrollment(&self, id: Uuid, owner: Uuid) -> StoreResult<()>;

    /// Apply a transition with its log row. Returns `false` if the lease was lost.
    async fn commit_transition(&self, transition: &Transition) -> StoreResult<bool>;

    // ===== Execution log =====

    async fn append_log(&self, entry: &LogEntry) -> StoreResult<()>;

    /// Completed attempt for one visit of a step, if any
    async fn completed_attempt(
        &self,
        enrollment_id: Uuid,
        step_id: Uuid,
        sequence: i32,
    ) -> StoreResult<Option<LogEntry>>;

    async fn query_logs(&self, query: &LogQuery) -> StoreResult<Vec<LogEntry>>;

    /// Delete log rows older than `cutoff` whose enrollment is terminal
    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}
