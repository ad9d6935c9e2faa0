// In-memory automation store for tests and local runs without Postgres

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use cadence_shared::{Automation, AutomationStatus, Enrollment, EnrollmentStatus, LogEntry, LogStatus, Step, TriggerType};

use super::{AutomationStore, LogQuery, StoreError, StoreResult, Transition};

#[derive(Default)]
struct MemoryState {
    automations: HashMap<Uuid, Automation>,
    steps: HashMap<Uuid, Vec<Step>>,
    enrollments: HashMap<Uuid, Enrollment>,
    enrollment_index: HashMap<(Uuid, Uuid), Uuid>,
    logs: Vec<LogEntry>,
}

#[derive(Default)]
pub struct MemoryAutomationStore {
    state: RwLock<MemoryState>,
}

impl MemoryAutomationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an enrollment directly. Test hook for simulating crashes.
    pub async fn put_enrollment(&self, enrollment: Enrollment) {
        let mut state = self.state.write().await;
        state
            .enrollment_index
            .insert((enrollment.automation_id, enrollment.contact_id), enrollment.id);
        state.enrollments.insert(enrollment.id, enrollment);
    }
}

#[async_trait]
impl AutomationStore for MemoryAutomationStore {
    async fn insert_automation(&self, automation: &Automation, steps: &[Step]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.automations.insert(automation.id, automation.clone());
        state.steps.insert(automation.id, steps.to_vec());
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> StoreResult<Option<Automation>> {
        Ok(self.state.read().await.automations.get(&id).cloned())
    }

    async fn list_automations(&self) -> StoreResult<Vec<Automation>> {
        let state = self.state.read().await;
        let mut automations: Vec<Automation> = state.automations.values().cloned().collect();
        automations.sort_by_key(|a| a.created_at);
        Ok(automations)
    }

    async fn update_automation(&self, automation: &Automation) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let existing = state
            .automations
            .get_mut(&automation.id)
            .ok_or_else(|| StoreError::NotFound(format!("Automation {}", automation.id)))?;

        // Counters are owned by the engine, never by callers
        let enrollment_count = existing.enrollment_count;
        let completed_count = existing.completed_count;
        *existing = automation.clone();
        existing.enrollment_count = enrollment_count;
        existing.completed_count = completed_count;
        Ok(())
    }

    async fn replace_steps(&self, automation: &Automation, steps: &[Step]) -> StoreResult<()> {
        self.update_automation(automation).await?;
        let mut state = self.state.write().await;
        state.steps.insert(automation.id, steps.to_vec());
        Ok(())
    }

    async fn get_steps(&self, automation_id: Uuid) -> StoreResult<Vec<Step>> {
        let state = self.state.read().await;
        let mut steps = state.steps.get(&automation_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.position);
        Ok(steps)
    }

    async fn active_automations_for_trigger(&self, trigger_type: TriggerType) -> StoreResult<Vec<Automation>> {
        let state = self.state.read().await;
        Ok(state
            .automations
            .values()
            .filter(|a| a.trigger_type == trigger_type && a.status == AutomationStatus::Active)
            .cloned()
            .collect())
    }

    async fn create_enrollment_if_absent(&self, enrollment: &Enrollment) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let key = (enrollment.automation_id, enrollment.contact_id);
        if state.enrollment_index.contains_key(&key) {
            return Ok(false);
        }

        state.enrollment_index.insert(key, enrollment.id);
        state.enrollments.insert(enrollment.id, enrollment.clone());
        if let Some(automation) = state.automations.get_mut(&enrollment.automation_id) {
            automation.enrollment_count += 1;
        }
        Ok(true)
    }

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>> {
        Ok(self.state.read().await.enrollments.get(&id).cloned())
    }

    async fn list_enrollments(&self, automation_id: Uuid, limit: i64) -> StoreResult<Vec<Enrollment>> {
        let state = self.state.read().await;
        let mut enrollments: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.automation_id == automation_id)
            .cloned()
            .collect();
        enrollments.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        enrollments.truncate(limit.max(0) as usize);
        Ok(enrollments)
    }

    async fn runnable_enrollments(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let state = self.state.read().await;
        let mut runnable: Vec<&Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.is_runnable(now) && e.lease_is_free(now))
            .filter(|e| {
                state
                    .automations
                    .get(&e.automation_id)
                    .is_some_and(|a| a.status == AutomationStatus::Active)
            })
            .collect();
        runnable.sort_by_key(|e| e.wait_until.unwrap_or(e.started_at));
        Ok(runnable.into_iter().take(limit.max(0) as usize).map(|e| e.id).collect())
    }

    async fn claim_enrollment(
        &self,
        id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>> {
        let mut state = self.state.write().await;
        let Some(enrollment) = state.enrollments.get_mut(&id) else {
            return Ok(None);
        };
        if enrollment.status != EnrollmentStatus::Active || !enrollment.lease_is_free(now) {
            return Ok(None);
        }

        enrollment.lease_owner = Some(owner);
        enrollment.lease_expires_at = Some(lease_until);
        Ok(Some(enrollment.clone()))
    }

    async fn release_enrollment(&self, id: Uuid, owner: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(enrollment) = state.enrollments.get_mut(&id) {
            if enrollment.lease_owner == Some(owner) {
                enrollment.lease_owner = None;
                enrollment.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn commit_transition(&self, transition: &Transition) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let next = &transition.enrollment;
        let Some(current) = state.enrollments.get_mut(&next.id) else {
            return Err(StoreError::NotFound(format!("Enrollment {}", next.id)));
        };
        if current.lease_owner != Some(transition.lease_owner) {
            return Ok(false);
        }

        let newly_completed =
            current.status != EnrollmentStatus::Completed && next.status == EnrollmentStatus::Completed;
        *current = next.clone();
        current.lease_owner = None;
        current.lease_expires_at = None;

        if let Some(log) = &transition.log {
            state.logs.push(log.clone());
        }
        if newly_completed {
            if let Some(automation) = state.automations.get_mut(&next.automation_id) {
                automation.completed_count += 1;
            }
        }
        Ok(true)
    }

    async fn append_log(&self, entry: &LogEntry) -> StoreResult<()> {
        self.state.write().await.logs.push(entry.clone());
        Ok(())
    }

    async fn completed_attempt(
        &self,
        enrollment_id: Uuid,
        step_id: Uuid,
        sequence: i32,
    ) -> StoreResult<Option<LogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .iter()
            .find(|l| {
                l.enrollment_id == enrollment_id
                    && l.step_id == step_id
                    && l.sequence == sequence
                    && l.status == LogStatus::Completed
            })
            .cloned())
    }

    async fn query_logs(&self, query: &LogQuery) -> StoreResult<Vec<LogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<LogEntry> = state.logs.iter().filter(|l| query.matches(l)).cloned().collect();
        // Insertion order breaks ties between rows written in the same instant
        entries.reverse();
        entries.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        entries.truncate(query.effective_limit() as usize);
        Ok(entries)
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let terminal: std::collections::HashSet<Uuid> = state
            .enrollments
            .values()
            .filter(|e| e.status.is_terminal())
            .map(|e| e.id)
            .collect();

        let before = state.logs.len();
        state
            .logs
            .retain(|l| l.executed_at >= cutoff || !terminal.contains(&l.enrollment_id));
        Ok((before - state.logs.len()) as u64)
    }
}
