//! Poll-until-done engine
//!
//! Drives a [`RemoteJobClient`] until the job reaches a terminal status or the
//! attempt budget runs out. Each attempt sleeps first, then performs exactly
//! one status round trip.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backoff::{duration_millis, next_delay};
use crate::client::RemoteJobClient;
use crate::error::{DocflowError, Result};
use crate::model::{JobStatus, ProcessedResult};

/// Attempt budget and backoff shape for polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Maximum number of status checks
    pub max_attempts: u32,

    /// Sleep before the first status check
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound for any single sleep
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor between consecutive sleeps
    pub multiplier: f64,
}

impl Default for PollConfig {
    /// 30 attempts, 2s initial delay doubling up to 30s
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30000),
            multiplier: 2.0,
        }
    }
}

impl PollConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sleep preceding status check number `attempt` (1-based)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        next_delay(
            attempt.saturating_sub(1),
            self.initial_delay,
            self.max_delay,
            self.multiplier,
        )
    }

    /// Worst-case time spent sleeping when every attempt is used
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts).map(|a| self.delay_before(a)).sum()
    }
}

/// Poll `job_id` until it is done, failed, or the attempt budget is exhausted
pub async fn poll_until_done(
    client: &dyn RemoteJobClient,
    job_id: &str,
    config: &PollConfig,
) -> Result<ProcessedResult> {
    poll_until_done_cancellable(client, job_id, config, &CancellationToken::new()).await
}

/// [`poll_until_done`] that stops with `Cancelled` as soon as `cancel` fires
///
/// Status checks for one job are strictly sequential. Errors from the client
/// propagate unchanged; only IN_PROGRESS is retried.
#[instrument(skip(client, config, cancel), fields(max_attempts = config.max_attempts))]
pub async fn poll_until_done_cancellable(
    client: &dyn RemoteJobClient,
    job_id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<ProcessedResult> {
    let mut last_status = None;

    for attempt in 1..=config.max_attempts {
        let delay = config.delay_before(attempt);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DocflowError::cancelled(format!(
                    "polling of job {job_id} cancelled before attempt {attempt}"
                )));
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let report = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DocflowError::cancelled(format!(
                    "polling of job {job_id} cancelled during attempt {attempt}"
                )));
            }
            report = client.get_status(job_id) => report?,
        };

        tracing::debug!(attempt, status = %report.status, delay_ms = delay.as_millis() as u64, "status check");
        last_status = Some(report.status);

        match report.status {
            JobStatus::Done => {
                let payload = client.get_result(job_id).await?;
                let result = ProcessedResult::from_job_payload(job_id, &payload)?;
                tracing::info!(attempt, "job done");
                return Ok(result);
            }
            JobStatus::Failed => {
                tracing::warn!(attempt, "remote processing failed");
                return Err(DocflowError::RemoteJobFailed {
                    job_id: job_id.to_string(),
                    attempt,
                });
            }
            JobStatus::InProgress => {}
        }
    }

    tracing::warn!("poll attempts exhausted");
    Err(DocflowError::Timeout {
        job_id: job_id.to_string(),
        attempts: config.max_attempts,
        last_status,
    })
}
