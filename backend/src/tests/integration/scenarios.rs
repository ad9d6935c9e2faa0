use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use cadence_shared::{BranchTarget, ConditionOperator, EnrollmentStatus, LogStatus, StepType, TriggerType};

use crate::automations::{AutomationStore, LogQuery, MemoryAutomationStore, RetryPolicy, TriggerEvent};
use crate::services::ContactSnapshot;
use crate::tests::fixtures::http_500;
use crate::tests::helpers::*;

/// send_email → wait(24h) → condition(tags contains vip) → add_tag(vip-reminder) | exit
fn vip_reminder_flow() -> (cadence_shared::Automation, Vec<cadence_shared::Step>) {
    automation_with(|id| {
        let reminder = tag_step(id, "vip-reminder", None);
        let check = condition_step(
            id,
            "tags",
            ConditionOperator::Contains,
            json!("vip"),
            BranchTarget::Goto { step_id: reminder.id },
            BranchTarget::Exit { reason: None },
        );
        let wait = wait_step(id, 24, Some(check.id));
        let email = email_step(id, Some(wait.id));
        vec![email, wait, check, reminder]
    })
}

#[tokio::test]
async fn test_vip_reminder_flow_branches_on_tag() {
    init_test_logging();
    let engine = test_engine();
    let (automation, steps) = vip_reminder_flow();
    engine.install(&automation, &steps).await;

    let vip = ContactSnapshot::new(Uuid::new_v4()).with_email("vip@example.com").with_tag("vip");
    let regular = ContactSnapshot::new(Uuid::new_v4()).with_email("regular@example.com");
    engine.contacts.insert(vip.clone()).await;
    engine.contacts.insert(regular.clone()).await;

    let vip_ids = engine.triggers.handle_event(&TriggerEvent::contact_created(vip.id, "import")).await.unwrap();
    let regular_ids = engine
        .triggers
        .handle_event(&TriggerEvent::contact_created(regular.id, "import"))
        .await
        .unwrap();
    assert_eq!(vip_ids.len(), 1);
    assert_eq!(regular_ids.len(), 1);

    let start = Utc::now();
    let summary = engine.run_until_idle(start).await;
    assert_eq!(summary.parked, 2);
    assert_eq!(engine.mailer.sent().await.len(), 2);

    // Nothing moves before the wait elapses
    let early = engine.run_until_idle(start + Duration::hours(23)).await;
    assert_eq!(early.executed, 0);

    engine.run_until_idle(start + Duration::hours(24)).await;

    let vip_enrollment = engine.store.get_enrollment(vip_ids[0]).await.unwrap().unwrap();
    assert_eq!(vip_enrollment.status, EnrollmentStatus::Completed);
    assert!(vip_enrollment.completed_at.is_some());
    assert!(engine.contacts.contact(vip.id).await.unwrap().has_tag("vip-reminder"));

    let regular_enrollment = engine.store.get_enrollment(regular_ids[0]).await.unwrap().unwrap();
    assert_eq!(regular_enrollment.status, EnrollmentStatus::Exited);
    assert!(regular_enrollment.exit_reason.is_some());
    assert!(!engine.contacts.contact(regular.id).await.unwrap().has_tag("vip-reminder"));

    let stored = engine.store.get_automation(automation.id).await.unwrap().unwrap();
    assert_eq!(stored.enrollment_count, 2);
    assert_eq!(stored.completed_count, 1);
}

#[tokio::test]
async fn test_webhook_retries_through_server_errors() {
    init_test_logging();
    let engine = test_engine_with(Arc::new(MemoryAutomationStore::new()), RetryPolicy::immediate(4));
    let (automation, steps) = automation_with(|id| {
        let done = tag_step(id, "synced", None);
        let hook = webhook_step(id, "https://crm.example.com/hooks/attendee", Some(done.id));
        vec![hook, done]
    });
    engine.install(&automation, &steps).await;
    engine.webhooks.respond_with(vec![http_500(), http_500(), http_500()]).await;

    let contact = ContactSnapshot::new(Uuid::new_v4()).with_email("ada@example.com");
    engine.contacts.insert(contact.clone()).await;
    let ids = engine.triggers.handle_event(&TriggerEvent::contact_created(contact.id, "api")).await.unwrap();

    engine.run_until_idle(Utc::now()).await;

    let enrollment = engine.store.get_enrollment(ids[0]).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert!(engine.contacts.contact(contact.id).await.unwrap().has_tag("synced"));

    let history = engine.log.history(enrollment.id).await.unwrap();
    let webhook_rows: Vec<_> = history.iter().filter(|e| e.step_type == Some(StepType::Webhook)).collect();
    let statuses: Vec<_> = webhook_rows.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![LogStatus::Failed, LogStatus::Failed, LogStatus::Failed, LogStatus::Completed]
    );
    let attempts: Vec<_> = webhook_rows.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    assert!(webhook_rows[0].error.as_deref().unwrap_or_default().contains("500"));

    // Every attempt carried the same idempotency key
    let requests = engine.webhooks.requests().await;
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|r| r.idempotency_key == requests[0].idempotency_key));
}

#[tokio::test]
async fn test_simultaneous_triggers_enroll_once() {
    let engine = test_engine();
    let (mut automation, steps) = automation_with(|id| vec![tag_step(id, "vip", None)]);
    automation.trigger_type = TriggerType::TagAdded;
    automation.trigger_config = json!({ "tag": "vip" });
    engine.install(&automation, &steps).await;

    let contact_id = Uuid::new_v4();
    let first = TriggerEvent::tag_added(contact_id, "vip");
    let second = TriggerEvent::tag_added(contact_id, "VIP");

    let (a, b) = tokio::join!(engine.triggers.handle_event(&first), engine.triggers.handle_event(&second));
    let created = a.unwrap().len() + b.unwrap().len();

    assert_eq!(created, 1);
    assert_eq!(engine.store.list_enrollments(automation.id, 10).await.unwrap().len(), 1);
    assert_eq!(engine.store.get_automation(automation.id).await.unwrap().unwrap().enrollment_count, 1);
}

#[tokio::test]
async fn test_parallel_events_from_many_tasks_enroll_once() {
    let engine = Arc::new(test_engine());
    let (automation, steps) = automation_with(|id| vec![tag_step(id, "welcomed", None)]);
    engine.install(&automation, &steps).await;
    let contact_id = Uuid::new_v4();
    engine.contacts.insert(ContactSnapshot::new(contact_id)).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .triggers
                    .handle_event(&TriggerEvent::contact_created(contact_id, "form"))
                    .await
                    .unwrap()
                    .len()
            })
        })
        .collect();

    let created: usize = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .sum();
    assert_eq!(created, 1);

    engine.run_until_idle(Utc::now()).await;
    let logs = engine.log.query(&LogQuery::for_contact(contact_id)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Completed);
}
