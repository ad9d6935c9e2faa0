// Job Scheduler - drives the enrollment poll and log retention in the background

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use crate::automations::{EnrollmentScheduler, ExecutionLog, SchedulerError, StoreError};

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Enrollment poll failed: {0}")]
    PollError(#[from] SchedulerError),
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub poll_interval_secs: u64,
    pub log_retention_days: i64,
    /// Cron expression for the retention sweep
    pub retention_schedule: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            log_retention_days: 180,
            retention_schedule: "0 30 3 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    EnrollmentPoll,
    LogRetention,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnrollmentPoll => "enrollment_poll",
            Self::LogRetention => "log_retention",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "enrollment_poll" => Some(Self::EnrollmentPoll),
            "log_retention" => Some(Self::LogRetention),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i64,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Job bodies, shared by the cron closures and manual runs
#[derive(Clone)]
struct JobRunner {
    engine: EnrollmentScheduler,
    log: ExecutionLog,
    config: JobConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobRunner {
    async fn run(&self, kind: JobKind) -> JobExecutionLog {
        let started_at = Utc::now();
        let result = match kind {
            JobKind::EnrollmentPoll => self.engine.poll().await.map(|n| n as i64).map_err(JobError::from),
            JobKind::LogRetention => {
                let cutoff = started_at - Duration::days(self.config.log_retention_days);
                self.log.purge_before(cutoff).await.map(|n| n as i64).map_err(JobError::from)
            }
        };

        let completed_at = Utc::now();
        let (status, items_processed, errors) = match result {
            Ok(items) => (JobStatus::Completed, items, Vec::new()),
            Err(e) => {
                error!("Job {} failed: {}", kind.name(), e);
                (JobStatus::Failed, 0, vec![e.to_string()])
            }
        };

        let entry = JobExecutionLog {
            id: Uuid::new_v4(),
            job_name: kind.name().to_string(),
            started_at,
            completed_at: Some(completed_at),
            status,
            items_processed,
            errors,
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
        };

        let mut logs = self.execution_logs.write().await;
        logs.push(entry.clone());
        if logs.len() > MAX_EXECUTION_LOGS {
            logs.remove(0);
        }
        entry
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    runner: JobRunner,
}

impl JobScheduler {
    pub async fn new(engine: EnrollmentScheduler, log: ExecutionLog, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            runner: JobRunner {
                engine,
                log,
                config,
                execution_logs: Arc::new(RwLock::new(Vec::new())),
            },
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_enrollment_poll().await?;
        self.schedule_log_retention().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_enrollment_poll(&self) -> JobResult<()> {
        let interval = self.runner.config.poll_interval_secs.max(1);
        let runner = self.runner.clone();

        let job = Job::new_repeated_async(std::time::Duration::from_secs(interval), move |_uuid, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.run(JobKind::EnrollmentPoll).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled enrollment poll every {} seconds", interval);
        Ok(())
    }

    async fn schedule_log_retention(&self) -> JobResult<()> {
        let schedule = self.runner.config.retention_schedule.clone();
        let runner = self.runner.clone();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
            let runner = runner.clone();
            Box::pin(async move {
                let entry = runner.run(JobKind::LogRetention).await;
                info!("Log retention removed {} execution log rows", entry.items_processed);
            })
        })?;

        self.scheduler.add(job).await?;
        info!(
            "Scheduled log retention ({}), keeping {} days",
            schedule, self.runner.config.log_retention_days
        );
        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.runner.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<JobExecutionLog> {
        let kind = JobKind::from_name(job_name)
            .ok_or_else(|| JobError::ConfigError(format!("Unknown job: {}", job_name)))?;
        Ok(self.runner.run(kind).await)
    }
}
