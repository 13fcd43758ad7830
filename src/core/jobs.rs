//! Job registry and the job plugin contract.
//!
//! Jobs are registered once at startup. The registry is then frozen behind
//! an `Arc` and shared with the executor and the policy config loader.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::Job;

/// Errors returned by job plugins
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Aborts the enclosing block; siblings are cancelled
    #[error("fatal: {0}")]
    Fatal(String),

    /// Only this job fails; siblings keep running
    #[error("{0}")]
    Failed(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    pub fn fatal(msg: impl Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    pub fn failed(msg: impl Display) -> Self {
        Self::Failed(msg.to_string())
    }

    pub fn invalid_args(msg: impl Display) -> Self {
        Self::InvalidArgs(msg.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Registry lookup failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0:?} is not registered")]
    JobNotFound(String),

    #[error("policy {0:?} is not registered")]
    PolicyNotFound(String),
}

/// A unit of work that can be referenced by name from a request.
///
/// `validate` must reject malformed arguments deterministically; it is
/// called before any `run`. `run` should poll `cancel` and return promptly
/// once it fires: the engine never force-kills a job.
#[async_trait]
pub trait JobPlugin: Send + Sync {
    fn validate(&self, job: &Job) -> Result<(), JobError>;

    async fn run(&self, cancel: CancellationToken, job: &Job) -> Result<(), JobError>;
}

/// Name to job plugin lookup
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn JobPlugin>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job plugin under `name`.
    ///
    /// # Panics
    ///
    /// If `name` is empty or already registered.
    pub fn register(&mut self, name: &str, job: impl JobPlugin + 'static) {
        assert!(!name.is_empty(), "job name must not be empty");
        assert!(
            !self.jobs.contains_key(name),
            "job {name:?} is already registered"
        );

        self.jobs.insert(name.to_string(), Arc::new(job));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn JobPlugin>, RegistryError> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::JobNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Parse a required argument into `T`
pub fn required_arg<T>(job: &Job, key: &str) -> Result<T, JobError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = job
        .arg(key)
        .ok_or_else(|| JobError::invalid_args(format!("missing argument {key:?}")))?;

    raw.parse()
        .map_err(|e| JobError::invalid_args(format!("argument {key:?}={raw:?}: {e}")))
}

/// Parse an optional argument into `T`, falling back to `default`
pub fn optional_arg<T>(job: &Job, key: &str, default: T) -> Result<T, JobError>
where
    T: FromStr,
    T::Err: Display,
{
    match job.arg(key) {
        None => Ok(default),
        Some(_) => required_arg(job, key),
    }
}
