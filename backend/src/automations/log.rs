// Execution log - append-only audit trail of step attempts, doubling as the idempotency ledger

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use cadence_shared::{Enrollment, LogEntry, LogStatus, Step, StepType};

use super::store::{AutomationStore, LogQuery, StoreResult};

/// Builder for log entries
pub struct LogEntryBuilder {
    automation_id: Uuid,
    enrollment_id: Uuid,
    contact_id: Uuid,
    step_id: Uuid,
    step_type: Option<StepType>,
    sequence: i32,
    attempt: i32,
    status: LogStatus,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    error: Option<String>,
    executed_at: DateTime<Utc>,
}

impl LogEntryBuilder {
    pub fn new(enrollment: &Enrollment, step: &Step, status: LogStatus) -> Self {
        Self::for_step_id(enrollment, step.id, Some(step.step_type()), status)
    }

    /// Entry for a step that may no longer exist in the automation
    pub fn for_step_id(
        enrollment: &Enrollment,
        step_id: Uuid,
        step_type: Option<StepType>,
        status: LogStatus,
    ) -> Self {
        Self {
            automation_id: enrollment.automation_id,
            enrollment_id: enrollment.id,
            contact_id: enrollment.contact_id,
            step_id,
            step_type,
            sequence: enrollment.sequence,
            attempt: 1,
            status,
            input: serde_json::Value::Null,
            output: None,
            error: None,
            executed_at: Utc::now(),
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt as i32;
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn output<T: Serialize>(mut self, output: &T) -> Self {
        self.output = serde_json::to_value(output).ok();
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn executed_at(mut self, at: DateTime<Utc>) -> Self {
        self.executed_at = at;
        self
    }

    pub fn build(self) -> LogEntry {
        LogEntry {
            id: Uuid::new_v4(),
            automation_id: self.automation_id,
            enrollment_id: self.enrollment_id,
            contact_id: self.contact_id,
            step_id: self.step_id,
            step_type: self.step_type,
            sequence: self.sequence,
            attempt: self.attempt,
            status: self.status,
            input: self.input,
            output: self.output,
            error: self.error,
            executed_at: self.executed_at,
        }
    }
}

#[derive(Clone)]
pub struct ExecutionLog {
    store: Arc<dyn AutomationStore>,
}

impl ExecutionLog {
    pub fn new(store: Arc<dyn AutomationStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: LogEntryBuilder) -> StoreResult<LogEntry> {
        let entry = entry.build();
        self.store.append_log(&entry).await?;
        Ok(entry)
    }

    /// Prior successful attempt for this visit of the step, if any
    pub async fn completed_attempt(&self, enrollment: &Enrollment, step_id: Uuid) -> StoreResult<Option<LogEntry>> {
        self.store
            .completed_attempt(enrollment.id, step_id, enrollment.sequence)
            .await
    }

    /// Newest first
    pub async fn query(&self, query: &LogQuery) -> StoreResult<Vec<LogEntry>> {
        self.store.query_logs(query).await
    }

    /// Oldest first, for enrollment inspection
    pub async fn history(&self, enrollment_id: Uuid) -> StoreResult<Vec<LogEntry>> {
        let mut entries = self.store.query_logs(&LogQuery::for_enrollment(enrollment_id)).await?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.store.purge_logs_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::store::MemoryAutomationStore;
    use crate::tests::helpers::tag_step;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_completed_attempt_is_scoped_to_visit() {
        let store = Arc::new(MemoryAutomationStore::new());
        let log = ExecutionLog::new(store.clone());
        let step = tag_step(Uuid::new_v4(), "vip", None);
        let mut enrollment = Enrollment::new(step.automation_id, Uuid::new_v4(), Utc::now());

        log.record(LogEntryBuilder::new(&enrollment, &step, LogStatus::Failed).error("boom"))
            .await
            .unwrap();
        assert!(log.completed_attempt(&enrollment, step.id).await.unwrap().is_none());

        log.record(
            LogEntryBuilder::new(&enrollment, &step, LogStatus::Completed)
                .attempt(2)
                .output(&json!({ "ok": true })),
        )
        .await
        .unwrap();
        let done = log.completed_attempt(&enrollment, step.id).await.unwrap().unwrap();
        assert_eq!(done.attempt, 2);

        // A later visit of the same step is a fresh key
        enrollment.sequence += 1;
        assert!(log.completed_attempt(&enrollment, step.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_is_chronological() {
        let store = Arc::new(MemoryAutomationStore::new());
        let log = ExecutionLog::new(store);
        let step = tag_step(Uuid::new_v4(), "vip", None);
        let enrollment = Enrollment::new(step.automation_id, Uuid::new_v4(), Utc::now());
        let start = Utc::now();

        for i in 0..3 {
            log.record(
                LogEntryBuilder::new(&enrollment, &step, LogStatus::Completed)
                    .attempt(i + 1)
                    .executed_at(start + Duration::seconds(i as i64)),
            )
            .await
            .unwrap();
        }

        let history = log.history(enrollment.id).await.unwrap();
        let attempts: Vec<i32> = history.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }
}
