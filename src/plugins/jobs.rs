//! Built-in jobs.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::jobs::{optional_arg, required_arg, JobError, JobPlugin};
use crate::domain::Job;

/// Sleeps for `seconds` (decimal, e.g. `"1"` or `"0.25"`)
pub struct SleepJob;

impl SleepJob {
    fn duration(job: &Job) -> Result<Duration, JobError> {
        let seconds: f64 = required_arg(job, "seconds")?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| JobError::invalid_args(format!("seconds={seconds}: {e}")))
    }
}

#[async_trait]
impl JobPlugin for SleepJob {
    fn validate(&self, job: &Job) -> Result<(), JobError> {
        Self::duration(job).map(|_| ())
    }

    async fn run(&self, cancel: CancellationToken, job: &Job) -> Result<(), JobError> {
        let duration = Self::duration(job)?;
        debug!(?duration, "sleeping");

        tokio::select! {
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Always fails; `fatal` (`"true"`/`"false"`) picks the error kind and
/// `message` sets its text
pub struct FailJob;

#[async_trait]
impl JobPlugin for FailJob {
    fn validate(&self, job: &Job) -> Result<(), JobError> {
        optional_arg(job, "fatal", false).map(|_| ())
    }

    async fn run(&self, _cancel: CancellationToken, job: &Job) -> Result<(), JobError> {
        let fatal = optional_arg(job, "fatal", false)?;
        let message = job.arg("message").unwrap_or("job failed");

        if fatal {
            Err(JobError::fatal(message))
        } else {
            Err(JobError::failed(message))
        }
    }
}
