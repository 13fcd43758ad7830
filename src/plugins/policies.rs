//! Built-in policies.

use std::collections::BTreeSet;

use anyhow::{bail, Context};
use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::jobs::JobRegistry;
use crate::core::policy::{Policy, PolicySettings};
use crate::domain::WorkRequest;

fn ensure_registered(jobs: &JobRegistry, name: &str) -> anyhow::Result<()> {
    if !jobs.contains(name) {
        bail!("job {name:?} is not registered");
    }
    Ok(())
}

/// Only jobs whose names match one of `jobs` (glob patterns) may appear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedJobs {
    pub jobs: Vec<String>,
}

impl AllowedJobs {
    fn patterns(&self) -> anyhow::Result<Vec<Pattern>> {
        self.jobs
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("bad job pattern {p:?}")))
            .collect()
    }
}

impl PolicySettings for AllowedJobs {
    fn validate(&self, jobs: &JobRegistry) -> anyhow::Result<()> {
        if self.jobs.is_empty() {
            bail!("at least one job must be allowed");
        }

        for pattern in self.patterns()? {
            if !jobs.names().iter().any(|name| pattern.matches(name)) {
                bail!("pattern {:?} matches no registered job", pattern.as_str());
            }
        }
        Ok(())
    }
}

pub struct AllowedJobsPolicy;

#[async_trait]
impl Policy for AllowedJobsPolicy {
    type Settings = AllowedJobs;

    async fn run(
        &self,
        _cancel: CancellationToken,
        req: &WorkRequest,
        settings: &AllowedJobs,
    ) -> anyhow::Result<()> {
        let patterns = settings.patterns()?;

        for job in req.jobs() {
            if !patterns.iter().any(|p| p.matches(&job.name)) {
                bail!("job {:?} is not allowed in workflow {:?}", job.name, req.name);
            }
        }
        Ok(())
    }
}

/// Every job named in `jobs` must carry the same value for `arg`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SameArgs {
    pub jobs: Vec<String>,
    pub arg: String,
}

impl PolicySettings for SameArgs {
    fn validate(&self, jobs: &JobRegistry) -> anyhow::Result<()> {
        if self.arg.is_empty() {
            bail!("arg must not be empty");
        }
        if self.jobs.is_empty() {
            bail!("at least one job must be listed");
        }
        for name in &self.jobs {
            ensure_registered(jobs, name)?;
        }
        Ok(())
    }
}

pub struct SameArgsPolicy;

#[async_trait]
impl Policy for SameArgsPolicy {
    type Settings = SameArgs;

    async fn run(
        &self,
        _cancel: CancellationToken,
        req: &WorkRequest,
        settings: &SameArgs,
    ) -> anyhow::Result<()> {
        let mut values = BTreeSet::new();

        for job in req.jobs().filter(|j| settings.jobs.contains(&j.name)) {
            match job.arg(&settings.arg) {
                Some(value) => {
                    values.insert(value);
                }
                None => bail!("job {:?} is missing argument {:?}", job.name, settings.arg),
            }
        }

        if values.len() > 1 {
            bail!(
                "jobs {:?} must share one value for {:?}, found {:?}",
                settings.jobs,
                settings.arg,
                values
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    First,
    Last,
}

/// The first (or last) block must consist solely of `job`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosition {
    pub job: String,
    pub position: Position,
}

impl PolicySettings for JobPosition {
    fn validate(&self, jobs: &JobRegistry) -> anyhow::Result<()> {
        ensure_registered(jobs, &self.job)
    }
}

pub struct JobPositionPolicy;

#[async_trait]
impl Policy for JobPositionPolicy {
    type Settings = JobPosition;

    async fn run(
        &self,
        _cancel: CancellationToken,
        req: &WorkRequest,
        settings: &JobPosition,
    ) -> anyhow::Result<()> {
        let block = match settings.position {
            Position::First => req.blocks.first(),
            Position::Last => req.blocks.last(),
        };

        let Some(block) = block else {
            bail!("request has no blocks");
        };

        if block.jobs.is_empty() || block.jobs.iter().any(|j| j.name != settings.job) {
            bail!(
                "the {:?} block must contain only {:?} jobs",
                settings.position,
                settings.job
            );
        }
        Ok(())
    }
}
