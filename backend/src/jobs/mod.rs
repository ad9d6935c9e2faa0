// Background Jobs
//
// Scheduled with tokio-cron-scheduler: the enrollment poll that feeds the
// automation workers, and the nightly execution log retention sweep.

pub mod scheduler;

pub use scheduler::{JobConfig, JobError, JobExecutionLog, JobKind, JobResult, JobScheduler, JobStatus};
