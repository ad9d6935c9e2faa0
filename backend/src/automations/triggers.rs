// Trigger evaluation - matches domain events against active automations and enrolls contacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use cadence_shared::{Automation, Enrollment, TriggerType};

use super::scheduler::EnrollmentScheduler;
use super::store::{AutomationStore, StoreResult};

/// A domain event that may enroll a contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub trigger_type: TriggerType,
    pub contact_id: Uuid,
    /// Conference event the domain event belongs to, if any
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub edition_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, contact_id: Uuid, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_type,
            contact_id,
            event_id: None,
            edition_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn scoped(mut self, event_id: Option<Uuid>, edition_id: Option<Uuid>) -> Self {
        self.event_id = event_id;
        self.edition_id = edition_id;
        self
    }

    pub fn contact_created(contact_id: Uuid, source: &str) -> Self {
        Self::new(TriggerType::ContactCreated, contact_id, serde_json::json!({ "source": source }))
    }

    pub fn tag_added(contact_id: Uuid, tag: &str) -> Self {
        Self::new(TriggerType::TagAdded, contact_id, serde_json::json!({ "tag": tag }))
    }

    pub fn ticket_purchased(contact_id: Uuid, event_id: Uuid, ticket_type_id: Uuid, order_id: Uuid) -> Self {
        Self::new(
            TriggerType::TicketPurchased,
            contact_id,
            serde_json::json!({
                "ticket_type_id": ticket_type_id,
                "order_id": order_id
            }),
        )
        .scoped(Some(event_id), None)
    }

    pub fn checked_in(contact_id: Uuid, event_id: Uuid, session_id: Option<Uuid>) -> Self {
        Self::new(
            TriggerType::CheckedIn,
            contact_id,
            serde_json::json!({ "session_id": session_id }),
        )
        .scoped(Some(event_id), None)
    }

    pub fn consent_given(contact_id: Uuid, consent_type: &str) -> Self {
        Self::new(
            TriggerType::ConsentGiven,
            contact_id,
            serde_json::json!({ "consent_type": consent_type }),
        )
    }

    pub fn talk_status(trigger_type: TriggerType, contact_id: Uuid, edition_id: Uuid, track: Option<&str>) -> Self {
        Self::new(trigger_type, contact_id, serde_json::json!({ "track": track })).scoped(None, Some(edition_id))
    }
}

/// Config keys each trigger type filters on; the payload carries the same key
fn config_keys(trigger_type: TriggerType) -> &'static [&'static str] {
    match trigger_type {
        TriggerType::ContactCreated => &["source"],
        TriggerType::TicketPurchased => &["ticket_type_id"],
        TriggerType::CheckedIn => &["session_id"],
        TriggerType::TagAdded => &["tag"],
        TriggerType::ConsentGiven => &["consent_type"],
        TriggerType::ScheduledDate => &["date_field"],
        TriggerType::TalkSubmitted | TriggerType::TalkAccepted | TriggerType::TalkRejected => &["track"],
    }
}

/// A missing or null config key matches anything; an array matches any member
pub fn matches_trigger_config(trigger_type: TriggerType, config: &Value, payload: &Value) -> bool {
    config_keys(trigger_type).iter().all(|key| {
        let expected = match config.get(*key) {
            None | Some(Value::Null) => return true,
            Some(expected) => expected,
        };
        let Some(actual) = payload.get(*key).filter(|v| !v.is_null()) else {
            return false;
        };
        match expected {
            Value::Array(options) => options.iter().any(|option| value_matches(option, actual)),
            single => value_matches(single, actual),
        }
    })
}

fn value_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::String(e), Value::String(a)) => e.trim().eq_ignore_ascii_case(a.trim()),
        _ => expected == actual,
    }
}

fn in_scope(automation: &Automation, event: &TriggerEvent) -> bool {
    automation.event_id.is_none_or(|id| event.event_id == Some(id))
        && automation.edition_id.is_none_or(|id| event.edition_id == Some(id))
}

pub struct TriggerEvaluator {
    store: Arc<dyn AutomationStore>,
    scheduler: EnrollmentScheduler,
}

impl TriggerEvaluator {
    pub fn new(store: Arc<dyn AutomationStore>, scheduler: EnrollmentScheduler) -> Self {
        Self { store, scheduler }
    }

    /// Enroll the event's contact in every matching active automation.
    /// Returns the ids of enrollments created by this call.
    pub async fn handle_event(&self, event: &TriggerEvent) -> StoreResult<Vec<Uuid>> {
        let automations = self.store.active_automations_for_trigger(event.trigger_type).await?;
        let mut created = Vec::new();

        for automation in automations {
            if !in_scope(&automation, event)
                || !matches_trigger_config(event.trigger_type, &automation.trigger_config, &event.payload)
            {
                debug!("Event {} does not match automation '{}'", event.id, automation.name);
                continue;
            }

            let enrollment = Enrollment::new(automation.id, event.contact_id, event.timestamp.min(Utc::now()));
            if !self.store.create_enrollment_if_absent(&enrollment).await? {
                debug!(
                    "Contact {} already enrolled in automation '{}'",
                    event.contact_id, automation.name
                );
                continue;
            }

            info!(
                "Enrolled contact {} in automation '{}' ({})",
                event.contact_id, automation.name, enrollment.id
            );
            self.scheduler.enqueue(enrollment.id).await;
            created.push(enrollment.id);
        }

        Ok(created)
    }
}
