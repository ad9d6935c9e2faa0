// Builders for automations, steps and a fully wired in-memory engine

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use cadence_shared::{
    Automation, AutomationStatus, BranchTarget, ConditionConfig, ConditionOperator, DelayUnit, SendEmailConfig, Step,
    StepKind, TagConfig, TriggerType, WaitConfig, WaitDelay, WebhookConfig,
};

use super::fixtures::{MemoryContactStore, RecordingMailer, ScriptedWebhookClient};
use crate::automations::{
    AutomationService, AutomationStore, EnrollmentScheduler, ExecutionLog, MemoryAutomationStore, RetryCoordinator,
    RetryPolicy, SchedulerConfig, StepExecutor, TickSummary, TriggerEvaluator,
};
use crate::services::WebhookSigner;

pub const TEST_SIGNING_SECRET: &str = "test-signing-secret";

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cadence_backend=debug")
        .with_test_writer()
        .try_init();
}

pub fn automation(trigger_type: TriggerType) -> Automation {
    Automation {
        id: Uuid::new_v4(),
        name: "Test automation".to_string(),
        description: None,
        event_id: None,
        edition_id: None,
        trigger_type,
        trigger_config: json!({}),
        status: AutomationStatus::Active,
        start_step_id: None,
        enrollment_count: 0,
        completed_count: 0,
        revision: 1,
        created_at: Utc::now(),
        updated_at: None,
    }
}

/// Active automation whose entry is the first step returned by `build`
pub fn automation_with<F>(build: F) -> (Automation, Vec<Step>)
where
    F: FnOnce(Uuid) -> Vec<Step>,
{
    let mut automation = automation(TriggerType::ContactCreated);
    let mut steps = build(automation.id);
    for (position, step) in steps.iter_mut().enumerate() {
        step.position = position as i32;
    }
    automation.start_step_id = steps.first().map(|s| s.id);
    (automation, steps)
}

pub fn step(automation_id: Uuid, kind: StepKind) -> Step {
    Step {
        id: Uuid::new_v4(),
        automation_id,
        position: 0,
        next_step_id: None,
        kind,
    }
}

fn linked(mut step: Step, next: Option<Uuid>) -> Step {
    step.next_step_id = next;
    step
}

pub fn tag_step(automation_id: Uuid, tag: &str, next: Option<Uuid>) -> Step {
    linked(step(automation_id, StepKind::AddTag(TagConfig { tag: tag.to_string() })), next)
}

pub fn remove_tag_step(automation_id: Uuid, tag: &str, next: Option<Uuid>) -> Step {
    linked(step(automation_id, StepKind::RemoveTag(TagConfig { tag: tag.to_string() })), next)
}

pub fn wait_step(automation_id: Uuid, hours: u32, next: Option<Uuid>) -> Step {
    let config = WaitConfig {
        delay: Some(WaitDelay { amount: hours, unit: DelayUnit::Hours }),
        until: None,
    };
    linked(step(automation_id, StepKind::Wait(config)), next)
}

pub fn wait_until_step(automation_id: Uuid, until: DateTime<Utc>, next: Option<Uuid>) -> Step {
    let config = WaitConfig { delay: None, until: Some(until) };
    linked(step(automation_id, StepKind::Wait(config)), next)
}

pub fn webhook_step(automation_id: Uuid, url: &str, next: Option<Uuid>) -> Step {
    let config = WebhookConfig {
        url: url.to_string(),
        headers: Default::default(),
        data: Value::Null,
    };
    linked(step(automation_id, StepKind::Webhook(config)), next)
}

pub fn email_step(automation_id: Uuid, next: Option<Uuid>) -> Step {
    let config = SendEmailConfig {
        subject: Some("Welcome {{first_name}}".to_string()),
        html_body: Some("<p>Hi {{first_name}}, see you at the event.</p>".to_string()),
        ..Default::default()
    };
    linked(step(automation_id, StepKind::SendEmail(config)), next)
}

pub fn condition_step(
    automation_id: Uuid,
    field: &str,
    operator: ConditionOperator,
    value: Value,
    on_true: BranchTarget,
    on_false: BranchTarget,
) -> Step {
    step(
        automation_id,
        StepKind::Condition(ConditionConfig {
            field: field.to_string(),
            operator,
            value,
            on_true,
            on_false,
        }),
    )
}

/// Engine wired to in-memory collaborators
pub struct TestEngine {
    pub store: Arc<MemoryAutomationStore>,
    pub contacts: Arc<MemoryContactStore>,
    pub mailer: Arc<RecordingMailer>,
    pub webhooks: Arc<ScriptedWebhookClient>,
    pub log: ExecutionLog,
    pub scheduler: EnrollmentScheduler,
    pub service: AutomationService,
    pub triggers: TriggerEvaluator,
}

pub fn test_engine() -> TestEngine {
    test_engine_with(Arc::new(MemoryAutomationStore::new()), RetryPolicy::immediate(3))
}

pub fn test_engine_with_store(store: Arc<MemoryAutomationStore>) -> TestEngine {
    test_engine_with(store, RetryPolicy::immediate(3))
}

pub fn test_engine_with(store: Arc<MemoryAutomationStore>, policy: RetryPolicy) -> TestEngine {
    let contacts = Arc::new(MemoryContactStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let webhooks = Arc::new(ScriptedWebhookClient::new());
    let dyn_store: Arc<dyn AutomationStore> = store.clone();

    let log = ExecutionLog::new(dyn_store.clone());
    let executor = StepExecutor::new(
        contacts.clone(),
        mailer.clone(),
        webhooks.clone(),
        WebhookSigner::new(Some(TEST_SIGNING_SECRET.to_string())),
        RetryCoordinator::new(policy, Duration::from_secs(5), log.clone()),
    );
    let scheduler = EnrollmentScheduler::new(
        dyn_store.clone(),
        contacts.clone(),
        executor,
        SchedulerConfig { workers: 4, queue_capacity: 64, ..SchedulerConfig::default() },
    );

    TestEngine {
        service: AutomationService::new(dyn_store.clone(), scheduler.clone()),
        triggers: TriggerEvaluator::new(dyn_store, scheduler.clone()),
        store,
        contacts,
        mailer,
        webhooks,
        log,
        scheduler,
    }
}

impl TestEngine {
    /// Store an already-built automation with its steps
    pub async fn install(&self, automation: &Automation, steps: &[Step]) {
        self.store
            .insert_automation(automation, steps)
            .await
            .expect("insert automation");
    }

    /// Tick at `now` until nothing runs; returns the combined summary
    pub async fn run_until_idle(&self, now: DateTime<Utc>) -> TickSummary {
        let mut total = TickSummary::default();
        for _ in 0..50 {
            let summary = self.scheduler.tick(now).await.expect("tick");
            total.selected += summary.selected;
            total.executed += summary.executed;
            total.parked += summary.parked;
            total.completed += summary.completed;
            total.exited += summary.exited;
            total.failed += summary.failed;
            total.skipped += summary.skipped;
            total.errors += summary.errors;
            if summary.executed == 0 {
                break;
            }
        }
        total
    }
}
