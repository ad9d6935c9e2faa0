// Automation service - authoring and lifecycle operations behind the HTTP API

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use cadence_shared::{Automation, AutomationStatus, Enrollment, LogEntry, Step, StepKind, TriggerType};

use super::graph::{GraphError, WorkflowGraph};
use super::log::ExecutionLog;
use super::scheduler::EnrollmentScheduler;
use super::store::{AutomationStore, LogQuery, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid automation graph: {0}")]
    InvalidGraph(#[from] GraphError),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type AutomationResult<T> = Result<T, AutomationError>;

/// Step as submitted by a client. Ids are optional so references between new
/// steps can be expressed by choosing them up front.
#[derive(Debug, Clone, Deserialize)]
pub struct StepInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub next_step_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAutomation {
    pub name: String,
    pub description: Option<String>,
    pub event_id: Option<Uuid>,
    pub edition_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: serde_json::Value,
    /// Defaults to the first step
    pub start_step_id: Option<Uuid>,
    #[serde(default)]
    pub steps: Vec<StepInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAutomation {
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceSteps {
    pub start_step_id: Option<Uuid>,
    pub steps: Vec<StepInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutomationDetail {
    #[serde(flatten)]
    pub automation: Automation,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentView {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub current_step: Option<Step>,
    pub history: Vec<LogEntry>,
}

#[derive(Clone)]
pub struct AutomationService {
    store: Arc<dyn AutomationStore>,
    scheduler: EnrollmentScheduler,
    log: ExecutionLog,
}

impl AutomationService {
    pub fn new(store: Arc<dyn AutomationStore>, scheduler: EnrollmentScheduler) -> Self {
        let log = ExecutionLog::new(store.clone());
        Self { store, scheduler, log }
    }

    pub async fn create(&self, input: CreateAutomation) -> AutomationResult<AutomationDetail> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(AutomationError::Invalid("Automation name is required".to_string()));
        }

        let id = Uuid::new_v4();
        let steps = build_steps(id, input.steps)?;
        let automation = Automation {
            id,
            name: name.to_string(),
            description: input.description,
            event_id: input.event_id,
            edition_id: input.edition_id,
            trigger_type: input.trigger_type,
            trigger_config: input.trigger_config,
            status: AutomationStatus::Draft,
            start_step_id: input.start_step_id.or_else(|| steps.first().map(|s| s.id)),
            enrollment_count: 0,
            completed_count: 0,
            revision: 1,
            created_at: Utc::now(),
            updated_at: None,
        };

        self.store.insert_automation(&automation, &steps).await?;
        info!("Created automation '{}' ({}) with {} steps", automation.name, automation.id, steps.len());
        Ok(AutomationDetail { automation, steps })
    }

    pub async fn get(&self, id: Uuid) -> AutomationResult<AutomationDetail> {
        let automation = self.load(id).await?;
        let steps = self.store.get_steps(id).await?;
        Ok(AutomationDetail { automation, steps })
    }

    pub async fn list(&self) -> AutomationResult<Vec<Automation>> {
        Ok(self.store.list_automations().await?)
    }

    pub async fn update(&self, id: Uuid, input: UpdateAutomation) -> AutomationResult<Automation> {
        let mut automation = self.load(id).await?;

        if let Some(name) = input.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AutomationError::Invalid("Automation name is required".to_string()));
            }
            automation.name = name.to_string();
        }
        if input.description.is_some() {
            automation.description = input.description;
        }

        let trigger_changed = input.trigger_type.is_some_and(|t| t != automation.trigger_type)
            || input.trigger_config.as_ref().is_some_and(|c| *c != automation.trigger_config);
        if let Some(trigger_type) = input.trigger_type {
            automation.trigger_type = trigger_type;
        }
        if let Some(trigger_config) = input.trigger_config {
            automation.trigger_config = trigger_config;
        }
        if trigger_changed {
            automation.revision += 1;
        }

        automation.updated_at = Some(Utc::now());
        self.store.update_automation(&automation).await?;
        Ok(automation)
    }

    /// Swap the step set. An active automation keeps running, so the new
    /// graph must be valid before it is stored.
    pub async fn replace_steps(&self, id: Uuid, input: ReplaceSteps) -> AutomationResult<AutomationDetail> {
        let mut automation = self.load(id).await?;
        let steps = build_steps(id, input.steps)?;

        automation.start_step_id = input.start_step_id.or_else(|| steps.first().map(|s| s.id));
        automation.revision += 1;
        automation.updated_at = Some(Utc::now());

        if automation.status == AutomationStatus::Active {
            WorkflowGraph::build(&automation, steps.clone())?;
        }

        self.store.replace_steps(&automation, &steps).await?;
        self.scheduler.invalidate(id).await;
        info!("Replaced steps of automation '{}' (revision {})", automation.name, automation.revision);
        Ok(AutomationDetail { automation, steps })
    }

    /// Validate the graph and start accepting enrollments. On a validation
    /// error the automation keeps its current status.
    pub async fn activate(&self, id: Uuid) -> AutomationResult<Automation> {
        let mut automation = self.load(id).await?;
        if automation.status == AutomationStatus::Active {
            return Ok(automation);
        }

        let steps = self.store.get_steps(id).await?;
        WorkflowGraph::build(&automation, steps)?;

        automation.status = AutomationStatus::Active;
        automation.updated_at = Some(Utc::now());
        self.store.update_automation(&automation).await?;
        info!("Activated automation '{}' ({})", automation.name, automation.id);
        Ok(automation)
    }

    /// Stop new enrollments and freeze in-flight ones where they are
    pub async fn pause(&self, id: Uuid) -> AutomationResult<Automation> {
        let mut automation = self.load(id).await?;
        match automation.status {
            AutomationStatus::Paused => return Ok(automation),
            AutomationStatus::Draft => {
                return Err(AutomationError::InvalidState(
                    "Only active automations can be paused".to_string(),
                ));
            }
            AutomationStatus::Active => {}
        }

        automation.status = AutomationStatus::Paused;
        automation.updated_at = Some(Utc::now());
        self.store.update_automation(&automation).await?;
        info!("Paused automation '{}' ({})", automation.name, automation.id);
        Ok(automation)
    }

    pub async fn enrollments(&self, automation_id: Uuid, limit: i64) -> AutomationResult<Vec<Enrollment>> {
        self.load(automation_id).await?;
        Ok(self.store.list_enrollments(automation_id, limit.clamp(1, 1000)).await?)
    }

    pub async fn enrollment(&self, id: Uuid) -> AutomationResult<EnrollmentView> {
        let enrollment = self
            .store
            .get_enrollment(id)
            .await?
            .ok_or_else(|| AutomationError::NotFound(format!("Enrollment {}", id)))?;

        let current_step = match enrollment.current_step_id {
            Some(step_id) => self
                .store
                .get_steps(enrollment.automation_id)
                .await?
                .into_iter()
                .find(|s| s.id == step_id),
            None => None,
        };
        let history = self.log.history(id).await?;

        Ok(EnrollmentView { enrollment, current_step, history })
    }

    pub async fn logs(&self, query: &LogQuery) -> AutomationResult<Vec<LogEntry>> {
        Ok(self.log.query(query).await?)
    }

    async fn load(&self, id: Uuid) -> AutomationResult<Automation> {
        self.store
            .get_automation(id)
            .await?
            .ok_or_else(|| AutomationError::NotFound(format!("Automation {}", id)))
    }
}

fn build_steps(automation_id: Uuid, inputs: Vec<StepInput>) -> AutomationResult<Vec<Step>> {
    let mut seen = HashSet::new();
    inputs
        .into_iter()
        .enumerate()
        .map(|(position, input)| {
            let id = input.id.unwrap_or_else(Uuid::new_v4);
            if !seen.insert(id) {
                return Err(AutomationError::InvalidGraph(GraphError::DuplicateStep(id)));
            }
            Ok(Step {
                id,
                automation_id,
                position: position as i32,
                next_step_id: input.next_step_id,
                kind: input.kind,
            })
        })
        .collect()
}
