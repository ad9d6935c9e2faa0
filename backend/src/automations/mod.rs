// Contact automation engine

pub mod conditions;
pub mod executor;
pub mod graph;
pub mod log;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod templates;
pub mod triggers;

pub use conditions::{ConditionError, ConditionEvaluator};
pub use executor::{ExecutorError, StepExecutor, StepOutcome, StepReport};
pub use graph::{GraphError, WorkflowGraph};
pub use log::{ExecutionLog, LogEntryBuilder};
pub use retry::{RetryCoordinator, RetryOutcome, RetryPolicy};
pub use scheduler::{EnrollmentScheduler, ProcessResult, SchedulerConfig, SchedulerError, TickSummary};
pub use service::{
    AutomationDetail, AutomationError, AutomationResult, AutomationService, CreateAutomation, EnrollmentView,
    ReplaceSteps, StepInput, UpdateAutomation,
};
pub use store::{AutomationStore, LogQuery, MemoryAutomationStore, PgAutomationStore, StoreError, StoreResult};
pub use triggers::{TriggerEvaluator, TriggerEvent};
