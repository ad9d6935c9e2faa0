// Enrollment scheduler - claims runnable enrollments, executes one step each and commits the transition

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cadence_shared::{Automation, AutomationStatus, Enrollment, EnrollmentStatus, LogStatus, Step};

use super::executor::{ExecutorError, StepExecutor, StepOutcome, StepReport};
use super::graph::{GraphError, WorkflowGraph};
use super::log::LogEntryBuilder;
use super::store::{AutomationStore, LogQuery, StoreError, Transition};
use crate::services::{ContactStore, ContactStoreError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Contact store unavailable: {0}")]
    Contacts(ContactStoreError),
    #[error("Automation graph is invalid: {0}")]
    Graph(#[from] GraphError),
    #[error("Worker pool already started")]
    AlreadyStarted,
}

impl From<ExecutorError> for SchedulerError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Store(e) => Self::Store(e),
            ExecutorError::Contacts(e) => Self::Contacts(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Enrollments selected per poll or tick
    pub batch_size: i64,
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            batch_size: 200,
            lease_ttl: Duration::minutes(5),
        }
    }
}

/// What happened to one enrollment on one pass
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// A step ran and its transition was committed
    Executed { outcome: StepOutcome, status: EnrollmentStatus },
    /// A wait elapsed and the enrollment moved past it
    Resumed { status: EnrollmentStatus },
    NotDue,
    /// Automation is not active; the enrollment stays frozen where it is
    Paused,
    /// Another worker holds the lease, or the enrollment is no longer active
    Contended,
    /// The lease expired mid-step and another worker took over
    LeaseLost,
}

impl ProcessResult {
    /// Whether the enrollment can take its next step right away
    pub fn runnable_again(&self) -> bool {
        match self {
            Self::Executed { outcome, status } => {
                *status == EnrollmentStatus::Active && matches!(outcome, StepOutcome::Advance { .. })
            }
            Self::Resumed { status } => *status == EnrollmentStatus::Active,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub selected: usize,
    pub executed: usize,
    pub parked: usize,
    pub completed: usize,
    pub exited: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, result: &ProcessResult) {
        match result {
            ProcessResult::Executed { outcome, status } => {
                self.executed += 1;
                if matches!(outcome, StepOutcome::Wait { .. }) {
                    self.parked += 1;
                }
                self.count_status(*status);
            }
            ProcessResult::Resumed { status } => {
                self.executed += 1;
                self.count_status(*status);
            }
            _ => self.skipped += 1,
        }
    }

    fn count_status(&mut self, status: EnrollmentStatus) {
        match status {
            EnrollmentStatus::Completed => self.completed += 1,
            EnrollmentStatus::Exited => self.exited += 1,
            EnrollmentStatus::Failed => self.failed += 1,
            EnrollmentStatus::Active => {}
        }
    }
}

struct SchedulerInner {
    store: Arc<dyn AutomationStore>,
    contacts: Arc<dyn ContactStore>,
    executor: StepExecutor,
    config: SchedulerConfig,
    graphs: RwLock<HashMap<Uuid, Arc<WorkflowGraph>>>,
    queued: Mutex<HashSet<Uuid>>,
    sender: mpsc::Sender<Uuid>,
    receiver: Mutex<Option<mpsc::Receiver<Uuid>>>,
}

#[derive(Clone)]
pub struct EnrollmentScheduler {
    inner: Arc<SchedulerInner>,
}

impl EnrollmentScheduler {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        contacts: Arc<dyn ContactStore>,
        executor: StepExecutor,
        config: SchedulerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                contacts,
                executor,
                config,
                graphs: RwLock::new(HashMap::new()),
                queued: Mutex::new(HashSet::new()),
                sender,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    /// Spawn the worker pool. Workers drain the queue fed by `poll` and `enqueue`.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, SchedulerError> {
        let receiver = self
            .inner
            .receiver
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = self.inner.config.workers.max(1);

        info!("Starting {} automation workers", workers);
        Ok((0..workers)
            .map(|worker| {
                let scheduler = self.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move { scheduler.worker_loop(worker, receiver).await })
            })
            .collect())
    }

    async fn worker_loop(&self, worker: usize, receiver: Arc<Mutex<mpsc::Receiver<Uuid>>>) {
        loop {
            let next = receiver.lock().await.recv().await;
            let Some(id) = next else {
                debug!("Automation worker {} stopping", worker);
                break;
            };
            self.inner.queued.lock().await.remove(&id);

            match self.process_enrollment(id, Utc::now()).await {
                Ok(result) if result.runnable_again() => {
                    self.enqueue(id).await;
                }
                Ok(result) => debug!("Enrollment {} on worker {}: {:?}", id, worker, result),
                Err(e) => error!("Enrollment {} failed to process on worker {}: {}", id, worker, e),
            }
        }
    }

    /// Queue an enrollment for the worker pool. Returns `false` if it is
    /// already queued or the queue is full; the next poll picks it up then.
    pub async fn enqueue(&self, id: Uuid) -> bool {
        let mut queued = self.inner.queued.lock().await;
        if !queued.insert(id) {
            return false;
        }
        match self.inner.sender.try_send(id) {
            Ok(()) => true,
            Err(e) => {
                queued.remove(&id);
                warn!("Could not queue enrollment {}: {}", id, e);
                false
            }
        }
    }

    /// Queue every runnable enrollment. Called by the poll job.
    pub async fn poll(&self) -> Result<usize, SchedulerError> {
        let ids = self
            .inner
            .store
            .runnable_enrollments(Utc::now(), self.inner.config.batch_size)
            .await?;

        let mut queued = 0;
        for id in ids {
            if self.enqueue(id).await {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!("Queued {} runnable enrollments", queued);
        }
        Ok(queued)
    }

    /// One synchronous pass: every runnable enrollment takes at most one step.
    /// Per-enrollment errors are logged and counted, never returned.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, SchedulerError> {
        let ids = self
            .inner
            .store
            .runnable_enrollments(now, self.inner.config.batch_size)
            .await?;

        let mut summary = TickSummary { selected: ids.len(), ..Default::default() };
        for id in ids {
            match self.process_enrollment(id, now).await {
                Ok(result) => summary.record(&result),
                Err(e) => {
                    error!("Enrollment {} failed to process: {}", id, e);
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Claim the enrollment, run its next step and commit the result
    pub async fn process_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> Result<ProcessResult, SchedulerError> {
        let owner = Uuid::new_v4();
        let lease_until = now + self.inner.config.lease_ttl;
        let Some(enrollment) = self
            .inner
            .store
            .claim_enrollment(id, owner, now, lease_until)
            .await?
        else {
            return Ok(ProcessResult::Contended);
        };

        let result = self.run_claimed(enrollment, owner, now).await;
        let committed = matches!(
            result,
            Ok(ProcessResult::Executed { .. } | ProcessResult::Resumed { .. } | ProcessResult::LeaseLost)
        );
        if !committed {
            if let Err(e) = self.inner.store.release_enrollment(id, owner).await {
                warn!("Failed to release lease on enrollment {}: {}", id, e);
            }
        }
        result
    }

    async fn run_claimed(
        &self,
        enrollment: Enrollment,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProcessResult, SchedulerError> {
        let automation = self
            .inner
            .store
            .get_automation(enrollment.automation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Automation {}", enrollment.automation_id)))?;

        if automation.status != AutomationStatus::Active {
            debug!("Automation '{}' is {:?}, enrollment {} stays frozen", automation.name, automation.status, enrollment.id);
            return Ok(ProcessResult::Paused);
        }
        if enrollment.wait_until.is_some_and(|until| now < until) {
            return Ok(ProcessResult::NotDue);
        }

        let graph = self.graph_for(&automation).await?;

        let step = match enrollment.current_step_id {
            None => graph.entry_step().clone(),
            Some(step_id) => match graph.step(step_id) {
                Some(step) => step.clone(),
                None => {
                    let error = format!("step {} no longer exists in automation", step_id);
                    return self.commit_failure(enrollment, step_id, owner, now, error).await;
                }
            },
        };

        if let Some(until) = enrollment.wait_until {
            return self.resume_wait(enrollment, &step, until, owner, now).await;
        }

        let mut positioned = enrollment;
        positioned.current_step_id = Some(step.id);

        let report = match self
            .inner
            .contacts
            .get_contact(positioned.contact_id)
            .await
        {
            Ok(Some(contact)) => self.inner.executor.execute(&positioned, &step, &contact, now).await?,
            Ok(None) => StepReport {
                outcome: StepOutcome::fail(format!("contact {} no longer exists", positioned.contact_id)),
                input: json!({ "contact_id": positioned.contact_id }),
                output: None,
                logged: false,
            },
            Err(e) if e.is_permanent() => StepReport {
                outcome: StepOutcome::fail(e.to_string()),
                input: json!({ "contact_id": positioned.contact_id }),
                output: None,
                logged: false,
            },
            Err(e) => return Err(SchedulerError::Contacts(e)),
        };

        let outcome = report.outcome.clone();
        let transition = Self::transition(&positioned, &step, report, owner, now);
        let status = transition.enrollment.status;
        if !self.commit(&transition).await? {
            return Ok(ProcessResult::LeaseLost);
        }

        debug!(
            "Enrollment {} ran {} step {} in '{}': {:?}",
            positioned.id,
            step.step_type(),
            step.id,
            automation.name,
            outcome
        );
        Ok(ProcessResult::Executed { outcome, status })
    }

    /// Move past an elapsed wait without re-running the step
    async fn resume_wait(
        &self,
        enrollment: Enrollment,
        step: &Step,
        until: DateTime<Utc>,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProcessResult, SchedulerError> {
        let log = LogEntryBuilder::new(&enrollment, step, LogStatus::Completed)
            .input(json!({ "wait_until": until }))
            .output(&json!({ "resumed_at": now }))
            .executed_at(now)
            .build();

        let mut next = enrollment;
        next.wait_until = None;
        next.sequence += 1;
        next.updated_at = Some(now);
        match step.next_step_id {
            Some(next_step_id) => next.current_step_id = Some(next_step_id),
            None => {
                next.status = EnrollmentStatus::Completed;
                next.completed_at = Some(now);
            }
        }

        let status = next.status;
        let transition = Transition { enrollment: next, lease_owner: owner, log: Some(log) };
        if !self.commit(&transition).await? {
            return Ok(ProcessResult::LeaseLost);
        }
        Ok(ProcessResult::Resumed { status })
    }

    /// Fail an enrollment that cannot run at all, e.g. its step was removed
    async fn commit_failure(
        &self,
        enrollment: Enrollment,
        step_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        error: String,
    ) -> Result<ProcessResult, SchedulerError> {
        warn!("Failing enrollment {}: {}", enrollment.id, error);

        // The step type survives only in earlier rows for the same step
        let history = self
            .inner
            .store
            .query_logs(&LogQuery::for_enrollment(enrollment.id))
            .await?;
        let step_type = history
            .iter()
            .find(|entry| entry.step_id == step_id)
            .and_then(|entry| entry.step_type);
        let log = LogEntryBuilder::for_step_id(&enrollment, step_id, step_type, LogStatus::Failed)
            .input(json!({ "missing_step_id": step_id }))
            .error(error.clone())
            .executed_at(now)
            .build();

        let mut next = enrollment;
        next.status = EnrollmentStatus::Failed;
        next.exited_at = Some(now);
        next.exit_reason = Some(error.clone());
        next.wait_until = None;
        next.updated_at = Some(now);

        let transition = Transition { enrollment: next, lease_owner: owner, log: Some(log) };
        if !self.commit(&transition).await? {
            return Ok(ProcessResult::LeaseLost);
        }
        Ok(ProcessResult::Executed {
            outcome: StepOutcome::Fail { error },
            status: EnrollmentStatus::Failed,
        })
    }

    async fn commit(&self, transition: &Transition) -> Result<bool, SchedulerError> {
        let committed = self.inner.store.commit_transition(transition).await?;
        if !committed {
            warn!(
                "Lease on enrollment {} expired before commit; another worker owns it now",
                transition.enrollment.id
            );
        }
        Ok(committed)
    }

    /// Validated graph for the automation's current revision
    pub async fn graph_for(&self, automation: &Automation) -> Result<Arc<WorkflowGraph>, SchedulerError> {
        if let Some(graph) = self.inner.graphs.read().await.get(&automation.id) {
            if graph.revision() == automation.revision {
                return Ok(graph.clone());
            }
        }

        let steps = self.inner.store.get_steps(automation.id).await?;
        let graph = Arc::new(WorkflowGraph::build(automation, steps)?);
        self.inner.graphs.write().await.insert(automation.id, graph.clone());
        Ok(graph)
    }

    /// Drop a cached graph, e.g. after its steps were replaced
    pub async fn invalidate(&self, automation_id: Uuid) {
        self.inner.graphs.write().await.remove(&automation_id);
    }

    /// Build the enrollment's next state from a step report
    fn transition(
        enrollment: &Enrollment,
        step: &Step,
        report: StepReport,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut next = enrollment.clone();
        next.updated_at = Some(now);

        let log_status = match &report.outcome {
            StepOutcome::Advance { next_step_id: Some(next_step_id) } => {
                next.current_step_id = Some(*next_step_id);
                next.sequence += 1;
                LogStatus::Completed
            }
            StepOutcome::Advance { next_step_id: None } => {
                next.status = EnrollmentStatus::Completed;
                next.completed_at = Some(now);
                next.sequence += 1;
                LogStatus::Completed
            }
            StepOutcome::Wait { until } => {
                next.wait_until = Some(*until);
                LogStatus::Pending
            }
            StepOutcome::Exit { reason } => {
                next.status = EnrollmentStatus::Exited;
                next.exited_at = Some(now);
                next.exit_reason = Some(reason.clone());
                next.sequence += 1;
                LogStatus::Completed
            }
            StepOutcome::Fail { error } => {
                next.status = EnrollmentStatus::Failed;
                next.exited_at = Some(now);
                next.exit_reason = Some(error.clone());
                LogStatus::Failed
            }
        };

        let log = (!report.logged).then(|| {
            let mut entry = LogEntryBuilder::new(enrollment, step, log_status)
                .input(report.input)
                .executed_at(now);
            if let Some(output) = &report.output {
                entry = entry.output(output);
            }
            if let StepOutcome::Fail { error } = &report.outcome {
                entry = entry.error(error.clone());
            }
            entry.build()
        });

        Transition { enrollment: next, lease_owner: owner, log }
    }
}
