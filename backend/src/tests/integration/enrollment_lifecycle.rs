use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use cadence_shared::{
    BranchTarget, ConditionOperator, Enrollment, EnrollmentStatus, FieldValue, LogStatus, StepKind, StepType,
    UpdateFieldConfig,
};

use crate::automations::{AutomationStore, ProcessResult, StepOutcome, TriggerEvent};
use crate::services::{ContactSnapshot, DeliveryError};
use crate::tests::helpers::*;

async fn enroll(engine: &TestEngine, contact: &ContactSnapshot) -> Uuid {
    engine.contacts.insert(contact.clone()).await;
    let ids = engine
        .triggers
        .handle_event(&TriggerEvent::contact_created(contact.id, "test"))
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    ids[0]
}

#[tokio::test]
async fn test_wait_resumes_exactly_at_boundary() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        let after = tag_step(id, "after-wait", None);
        let wait = wait_step(id, 2, Some(after.id));
        vec![wait, after]
    });
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4());
    let id = enroll(&engine, &contact).await;

    let start = Utc::now();
    engine.run_until_idle(start).await;
    let parked = engine.store.get_enrollment(id).await.unwrap().unwrap();
    let until = parked.wait_until.unwrap();
    assert_eq!(until, start + Duration::hours(2));

    assert_eq!(
        engine.scheduler.process_enrollment(id, until - Duration::seconds(1)).await.unwrap(),
        ProcessResult::NotDue
    );
    assert_eq!(engine.run_until_idle(until - Duration::seconds(1)).await.executed, 0);

    engine.run_until_idle(until).await;
    let done = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert!(done.wait_until.is_none());
    assert!(engine.contacts.contact(contact.id).await.unwrap().has_tag("after-wait"));

    let wait_rows: Vec<_> = engine
        .log
        .history(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.step_type == Some(StepType::Wait))
        .map(|e| e.status)
        .collect();
    assert_eq!(wait_rows, vec![LogStatus::Pending, LogStatus::Completed]);
}

#[tokio::test]
async fn test_crash_after_send_does_not_resend() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        let after = tag_step(id, "welcomed", None);
        let email = email_step(id, Some(after.id));
        vec![email, after]
    });
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4()).with_email("ada@example.com");
    let id = enroll(&engine, &contact).await;
    let before_send = engine.store.get_enrollment(id).await.unwrap().unwrap();

    let now = Utc::now();
    engine.scheduler.process_enrollment(id, now).await.unwrap();
    assert_eq!(engine.mailer.sent().await.len(), 1);

    // The process died after delivering but before the transition landed
    engine.store.put_enrollment(before_send).await;
    engine.run_until_idle(now).await;

    assert_eq!(engine.mailer.sent().await.len(), 1);
    let enrollment = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);

    let email_rows: Vec<_> = engine
        .log
        .history(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.step_type == Some(StepType::SendEmail))
        .map(|e| e.status)
        .collect();
    assert_eq!(email_rows, vec![LogStatus::Completed, LogStatus::Skipped]);
}

#[tokio::test]
async fn test_paused_automation_freezes_enrollments() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        let second = tag_step(id, "second", None);
        let first = tag_step(id, "first", Some(second.id));
        vec![first, second]
    });
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4());
    let id = enroll(&engine, &contact).await;

    let now = Utc::now();
    engine.scheduler.process_enrollment(id, now).await.unwrap();
    engine.service.pause(automation.id).await.unwrap();

    assert_eq!(engine.run_until_idle(now).await.executed, 0);
    // A worker that already dequeued it still backs off after claiming
    assert_eq!(engine.scheduler.process_enrollment(id, now).await.unwrap(), ProcessResult::Paused);

    let frozen = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(frozen.status, EnrollmentStatus::Active);
    assert_eq!(frozen.current_step_id, Some(steps[1].id));
    assert!(frozen.lease_owner.is_none());
    assert!(!engine.contacts.contact(contact.id).await.unwrap().has_tag("second"));

    // Paused automations do not take new enrollments either
    let other = ContactSnapshot::new(Uuid::new_v4());
    engine.contacts.insert(other.clone()).await;
    let created = engine
        .triggers
        .handle_event(&TriggerEvent::contact_created(other.id, "test"))
        .await
        .unwrap();
    assert!(created.is_empty());

    engine.service.activate(automation.id).await.unwrap();
    engine.run_until_idle(now).await;
    let resumed = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(resumed.status, EnrollmentStatus::Completed);
    assert!(engine.contacts.contact(contact.id).await.unwrap().has_tag("second"));
}

#[tokio::test]
async fn test_condition_reads_contact_at_evaluation_time() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        let check = condition_step(
            id,
            "tags",
            ConditionOperator::Contains,
            json!("speaker"),
            BranchTarget::Complete,
            BranchTarget::Exit { reason: Some("not a speaker".to_string()) },
        );
        let wait = wait_step(id, 1, Some(check.id));
        vec![wait, check]
    });
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4());
    let id = enroll(&engine, &contact).await;

    let start = Utc::now();
    engine.run_until_idle(start).await;

    // Tagged while the enrollment was parked
    engine.contacts.insert(contact.clone().with_tag("speaker")).await;
    engine.run_until_idle(start + Duration::hours(1)).await;

    let enrollment = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_exit_branch_records_reason() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        vec![condition_step(
            id,
            "fields.ticket_count",
            ConditionOperator::GreaterThan,
            json!(0),
            BranchTarget::Complete,
            BranchTarget::Exit { reason: Some("no tickets".to_string()) },
        )]
    });
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4()).with_field("ticket_count", json!(0));
    let id = enroll(&engine, &contact).await;

    let result = engine.scheduler.process_enrollment(id, Utc::now()).await.unwrap();
    assert_eq!(
        result,
        ProcessResult::Executed {
            outcome: StepOutcome::Exit { reason: "no tickets".to_string() },
            status: EnrollmentStatus::Exited,
        }
    );

    let enrollment = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(enrollment.exit_reason.as_deref(), Some("no tickets"));
    assert!(enrollment.exited_at.is_some());
    assert!(enrollment.completed_at.is_none());
}

#[tokio::test]
async fn test_permanent_email_failure_fails_enrollment() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| vec![email_step(id, None)]);
    engine.install(&automation, &steps).await;
    engine
        .mailer
        .fail_next(DeliveryError::Permanent("550 mailbox unavailable".to_string()))
        .await;
    let contact = ContactSnapshot::new(Uuid::new_v4()).with_email("gone@example.com");
    let id = enroll(&engine, &contact).await;

    let summary = engine.run_until_idle(Utc::now()).await;
    assert_eq!(summary.failed, 1);

    let enrollment = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    assert!(enrollment.exit_reason.unwrap().contains("550"));

    let rows = engine.log.history(id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, LogStatus::Failed);
}

#[tokio::test]
async fn test_deleted_contact_fails_enrollment() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| vec![tag_step(id, "vip", None)]);
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4());
    let id = enroll(&engine, &contact).await;
    engine.contacts.delete(contact.id).await;

    engine.run_until_idle(Utc::now()).await;

    let enrollment = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    let rows = engine.log.history(id).await.unwrap();
    assert_eq!(rows[0].status, LogStatus::Failed);
    assert!(rows[0].error.as_deref().unwrap_or_default().contains("no longer exists"));
}

#[tokio::test]
async fn test_contact_store_outage_retries_later() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| vec![tag_step(id, "vip", None)]);
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4());
    let id = enroll(&engine, &contact).await;

    engine.contacts.set_unavailable(true);
    let now = Utc::now();
    let summary = engine.scheduler.tick(now).await.unwrap();
    assert_eq!(summary.errors, 1);

    let untouched = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(untouched.status, EnrollmentStatus::Active);
    assert!(untouched.lease_owner.is_none());

    engine.contacts.set_unavailable(false);
    engine.run_until_idle(now).await;
    let done = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_held_lease_is_skipped_until_expiry() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| vec![tag_step(id, "vip", None)]);
    engine.install(&automation, &steps).await;
    let contact = ContactSnapshot::new(Uuid::new_v4());
    let id = enroll(&engine, &contact).await;

    let now = Utc::now();
    let other_worker = Uuid::new_v4();
    engine
        .store
        .claim_enrollment(id, other_worker, now, now + Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(engine.scheduler.process_enrollment(id, now).await.unwrap(), ProcessResult::Contended);

    // The other worker crashed; its lease runs out
    engine.run_until_idle(now + Duration::minutes(6)).await;
    let done = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_update_field_renders_template() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        vec![step(
            id,
            StepKind::UpdateField(UpdateFieldConfig {
                field: "fields.greeting".to_string(),
                value: FieldValue::Template { template: "Hello {{first_name}}".to_string() },
            }),
        )]
    });
    engine.install(&automation, &steps).await;
    let mut contact = ContactSnapshot::new(Uuid::new_v4());
    contact.first_name = Some("Grace".to_string());
    enroll(&engine, &contact).await;

    engine.run_until_idle(Utc::now()).await;

    let updated = engine.contacts.contact(contact.id).await.unwrap();
    assert_eq!(updated.fields.get("greeting"), Some(&json!("Hello Grace")));
}

#[tokio::test]
async fn test_removed_step_fails_in_flight_enrollment() {
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| vec![tag_step(id, "vip", None)]);
    engine.install(&automation, &steps).await;

    let mut stranded = Enrollment::new(automation.id, Uuid::new_v4(), Utc::now());
    stranded.current_step_id = Some(Uuid::new_v4());
    engine.contacts.insert(ContactSnapshot::new(stranded.contact_id)).await;
    engine.store.put_enrollment(stranded.clone()).await;

    engine.run_until_idle(Utc::now()).await;
    let enrollment = engine.store.get_enrollment(stranded.id).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    assert!(enrollment.exit_reason.unwrap().contains("no longer exists"));

    let rows = engine.log.history(stranded.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, LogStatus::Failed);
    assert_eq!(rows[0].step_id, stranded.current_step_id.unwrap());
    assert_eq!(rows[0].step_type, None);
    assert_eq!(rows[0].input["missing_step_id"], json!(stranded.current_step_id));
    assert!(rows[0].error.as_deref().unwrap_or_default().contains("no longer exists"));
}

#[tokio::test]
async fn test_wait_removed_while_parked_is_logged_as_wait_failure() {
    let engine = test_engine();
    let (mut automation, steps) = automation_with(|id| {
        let after = tag_step(id, "after", None);
        let wait = wait_step(id, 1, Some(after.id));
        vec![wait, after]
    });
    engine.install(&automation, &steps).await;
    let id = enroll(&engine, &ContactSnapshot::new(Uuid::new_v4())).await;

    let start = Utc::now();
    engine.run_until_idle(start).await;
    let parked = engine.store.get_enrollment(id).await.unwrap().unwrap();
    let wait_id = parked.current_step_id.unwrap();

    let replacement = tag_step(automation.id, "replacement", None);
    automation.start_step_id = Some(replacement.id);
    automation.revision += 1;
    engine.store.replace_steps(&automation, &[replacement]).await.unwrap();

    engine.run_until_idle(start + Duration::hours(2)).await;
    let enrollment = engine.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Failed);

    let history = engine.log.history(id).await.unwrap();
    let failed: Vec<_> = history.iter().filter(|e| e.status == LogStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step_id, wait_id);
    assert_eq!(failed[0].step_type, Some(StepType::Wait));
}

#[tokio::test]
async fn test_worker_pool_drains_queue() {
    init_test_logging();
    let engine = test_engine();
    let (automation, steps) = automation_with(|id| {
        let second = tag_step(id, "second", None);
        let first = tag_step(id, "first", Some(second.id));
        vec![first, second]
    });
    engine.install(&automation, &steps).await;
    let workers = engine.scheduler.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(enroll(&engine, &ContactSnapshot::new(Uuid::new_v4())).await);
    }

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let mut done = 0;
        for id in &ids {
            if engine.store.get_enrollment(*id).await.unwrap().unwrap().status == EnrollmentStatus::Completed {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workers did not finish in time");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert!(engine.scheduler.start().await.is_err());
    for worker in workers {
        worker.abort();
    }
}
