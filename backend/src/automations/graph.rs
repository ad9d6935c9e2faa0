// Workflow graph - validated arena of steps with a resolved successor map

use std::collections::HashMap;
use uuid::Uuid;

use cadence_shared::{Automation, BranchTarget, SendEmailConfig, Step, StepKind, WaitConfig, WaitDelay};

use super::conditions::ConditionEvaluator;
use crate::services::contacts::ContactField;

/// Structural problems that keep an automation from being activated
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Automation has no start step")]
    MissingStartStep,
    #[error("Start step {0} does not belong to this automation")]
    UnknownStartStep(Uuid),
    #[error("Step {step_id} belongs to automation {automation_id}")]
    ForeignStep { step_id: Uuid, automation_id: Uuid },
    #[error("Step {0} appears more than once")]
    DuplicateStep(Uuid),
    #[error("Step {from} references missing step {to}")]
    DanglingReference { from: Uuid, to: Uuid },
    #[error("Step {step_id} has invalid config: {reason}")]
    InvalidConfig { step_id: Uuid, reason: String },
    #[error("Cycle without a wait step: {}", format_cycle(.0))]
    ZeroWaitCycle(Vec<Uuid>),
}

fn format_cycle(steps: &[Uuid]) -> String {
    steps.iter().map(Uuid::to_string).collect::<Vec<_>>().join(" -> ")
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    automation_id: Uuid,
    revision: i64,
    entry: usize,
    steps: Vec<Step>,
    index: HashMap<Uuid, usize>,
    successors: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    pub fn build(automation: &Automation, steps: Vec<Step>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.automation_id != automation.id {
                return Err(GraphError::ForeignStep {
                    step_id: step.id,
                    automation_id: step.automation_id,
                });
            }
            if index.insert(step.id, i).is_some() {
                return Err(GraphError::DuplicateStep(step.id));
            }
            validate_config(step).map_err(|reason| GraphError::InvalidConfig { step_id: step.id, reason })?;
        }

        let start = automation.start_step_id.ok_or(GraphError::MissingStartStep)?;
        let entry = *index.get(&start).ok_or(GraphError::UnknownStartStep(start))?;

        let mut successors = Vec::with_capacity(steps.len());
        for step in &steps {
            let resolved = references(step)
                .into_iter()
                .map(|to| {
                    index
                        .get(&to)
                        .copied()
                        .ok_or(GraphError::DanglingReference { from: step.id, to })
                })
                .collect::<Result<Vec<_>, _>>()?;
            successors.push(resolved);
        }

        let graph = Self {
            automation_id: automation.id,
            revision: automation.revision,
            entry,
            steps,
            index,
            successors,
        };
        graph.check_zero_wait_cycles()?;
        Ok(graph)
    }

    pub fn automation_id(&self) -> Uuid {
        self.automation_id
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn entry_step(&self) -> &Step {
        &self.steps[self.entry]
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.index.get(&id).map(|&i| &self.steps[i])
    }

    pub fn successors_of(&self, id: Uuid) -> Vec<&Step> {
        self.index
            .get(&id)
            .map(|&i| self.successors[i].iter().map(|&s| &self.steps[s]).collect())
            .unwrap_or_default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Depth-first search over the steps reachable from the entry. Edges
    /// leaving a wait step are dropped, so any back edge that remains closes a
    /// cycle with no wait in it.
    fn check_zero_wait_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::New; self.steps.len()];
        for root in self.reachable() {
            if marks[root] != Mark::New {
                continue;
            }

            // (node, index of the next successor to visit)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(&(node, cursor)) = stack.last() {
                let edges = self.wait_free_successors(node);
                if cursor == edges.len() {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                }

                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = edges[cursor];
                match marks[next] {
                    Mark::New => {
                        marks[next] = Mark::OnStack;
                        stack.push((next, 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut cycle: Vec<Uuid> = stack[start..].iter().map(|&(n, _)| self.steps[n].id).collect();
                        cycle.push(self.steps[next].id);
                        return Err(GraphError::ZeroWaitCycle(cycle));
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }

    fn wait_free_successors(&self, node: usize) -> &[usize] {
        if matches!(self.steps[node].kind, StepKind::Wait(_)) {
            &[]
        } else {
            &self.successors[node]
        }
    }

    /// All steps reachable from the entry step
    fn reachable(&self) -> Vec<usize> {
        let mut seen = vec![false; self.steps.len()];
        let mut stack = vec![self.entry];
        let mut out = Vec::new();
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            out.push(n);
            stack.extend(self.successors[n].iter().copied());
        }
        out
    }
}

/// Every step id a step can hand control to
fn references(step: &Step) -> Vec<Uuid> {
    match &step.kind {
        StepKind::Condition(condition) => [&condition.on_true, &condition.on_false]
            .into_iter()
            .filter_map(BranchTarget::step_id)
            .collect(),
        _ => step.next_step_id.into_iter().collect(),
    }
}

fn validate_config(step: &Step) -> Result<(), String> {
    match &step.kind {
        StepKind::SendEmail(config) => validate_email(config),
        StepKind::Wait(config) => validate_wait(config),
        StepKind::Condition(config) => {
            ConditionEvaluator::validate_field(&config.field).map_err(|e| e.to_string())?;
            if config.operator.needs_value() && config.value.is_null() {
                return Err(format!("operator {:?} needs a value", config.operator));
            }
            if step.next_step_id.is_some() {
                return Err("condition steps branch through on_true/on_false, not next_step_id".to_string());
            }
            Ok(())
        }
        StepKind::AddTag(config) | StepKind::RemoveTag(config) => {
            if config.tag.trim().is_empty() {
                Err("tag must not be empty".to_string())
            } else {
                Ok(())
            }
        }
        StepKind::UpdateField(config) => ContactField::parse(&config.field).map(|_| ()).map_err(|e| e.to_string()),
        StepKind::Webhook(config) => match url::Url::parse(&config.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => Err(format!("unsupported webhook scheme '{}'", url.scheme())),
            Err(e) => Err(format!("invalid webhook url: {}", e)),
        },
    }
}

fn validate_email(config: &SendEmailConfig) -> Result<(), String> {
    let has_template = config.template_id.as_deref().is_some_and(|t| !t.trim().is_empty());
    let has_inline = config.subject.as_deref().is_some_and(|s| !s.trim().is_empty())
        && config.html_body.as_deref().is_some_and(|b| !b.trim().is_empty());
    if has_template || has_inline {
        Ok(())
    } else {
        Err("email needs a template_id or a subject and html_body".to_string())
    }
}

fn validate_wait(config: &WaitConfig) -> Result<(), String> {
    match (&config.delay, &config.until) {
        (Some(delay), None) if delay.amount == 0 => Err("wait delay must be positive".to_string()),
        (Some(delay), None) if delay.exceeds_max() => {
            Err(format!("wait delay must not exceed {} days", WaitDelay::MAX_DAYS))
        }
        (Some(_), None) | (None, Some(_)) => Ok(()),
        (None, None) => Err("wait needs a delay or an until time".to_string()),
        (Some(_), Some(_)) => Err("wait takes either a delay or an until time, not both".to_string()),
    }
}
