// Retry coordinator - bounded exponential backoff for steps with network side effects

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use cadence_shared::{Enrollment, LogStatus, Step};

use super::log::{ExecutionLog, LogEntryBuilder};
use super::store::StoreResult;
use crate::services::DeliveryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No backoff between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let secs = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(capped / 2.0..=capped)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// Result of running a side effect under the retry policy
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Delivered { attempts: u32, output: serde_json::Value },
    /// A previous run already completed this visit; nothing was sent
    AlreadyDone { attempt: i32 },
    Failed { attempts: u32, error: DeliveryError },
}

#[derive(Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    timeout: Duration,
    log: ExecutionLog,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy, timeout: Duration, log: ExecutionLog) -> Self {
        Self { policy, timeout, log }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt_fn` until it succeeds, fails permanently or the policy is
    /// exhausted. Every attempt is written to the execution log.
    pub async fn run<F, Fut>(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        input: &serde_json::Value,
        mut attempt_fn: F,
    ) -> StoreResult<RetryOutcome>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, DeliveryError>>,
    {
        if let Some(previous) = self.log.completed_attempt(enrollment, step.id).await? {
            info!(
                "Step {} already completed for enrollment {} (attempt {}), not resending",
                step.id, enrollment.id, previous.attempt
            );
            self.log
                .record(
                    LogEntryBuilder::new(enrollment, step, LogStatus::Skipped)
                        .attempt(previous.attempt.max(1) as u32)
                        .input(input.clone())
                        .output(&json!({ "completed_entry": previous.id })),
                )
                .await?;
            return Ok(RetryOutcome::AlreadyDone { attempt: previous.attempt });
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, attempt_fn(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Transient(format!(
                    "timed out after {}s",
                    self.timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(output) => {
                    self.log
                        .record(
                            LogEntryBuilder::new(enrollment, step, LogStatus::Completed)
                                .attempt(attempt)
                                .input(input.clone())
                                .output(&output),
                        )
                        .await?;
                    return Ok(RetryOutcome::Delivered { attempts: attempt, output });
                }
                Err(error) => {
                    self.log
                        .record(
                            LogEntryBuilder::new(enrollment, step, LogStatus::Failed)
                                .attempt(attempt)
                                .input(input.clone())
                                .error(error.to_string()),
                        )
                        .await?;

                    if !error.is_transient() || attempt >= max_attempts {
                        warn!(
                            "Step {} for enrollment {} failed after {} attempt(s): {}",
                            step.id, enrollment.id, attempt, error
                        );
                        return Ok(RetryOutcome::Failed { attempts: attempt, error });
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "Step {} for enrollment {} failed (attempt {}/{}), retrying in {:?}: {}",
                        step.id, enrollment.id, attempt, max_attempts, delay, error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
