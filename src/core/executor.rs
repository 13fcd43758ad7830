//! Executes a single work request.
//!
//! Blocks run strictly in order; the jobs inside a block run concurrently,
//! bounded by the block's rate limit. A fatal job error cancels the rest of
//! its block, and any failed block ends the run. The emergency stop for the
//! workflow is watched for the whole run and cancels it when triggered.
//!
//! Status is published through a `watch` channel: a single slot that always
//! holds the latest snapshot, so slow observers skip intermediate updates
//! instead of queueing them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{Status, WorkRequest, WorkStatus};

use super::estop::{EmergencyStop, StopStatus};
use super::jobs::{JobError, JobPlugin, JobRegistry};
use super::policy::{PolicyEngine, PolicyError};
use super::policy_config::PolicyConfigReader;

/// Why a request was refused before execution
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("request has no blocks")]
    NoBlocks,

    #[error("block {block} has no jobs")]
    EmptyBlock { block: usize },

    #[error("block {block} job {index}: job {name:?} is not registered")]
    UnknownJob {
        block: usize,
        index: usize,
        name: String,
    },

    #[error("block {block} job {index} ({name}): {source}")]
    InvalidJob {
        block: usize,
        index: usize,
        name: String,
        #[source]
        source: JobError,
    },

    #[error("no policy configuration for workflow {0:?}")]
    NoPolicyBinding(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ValidationError {
    /// True when a policy tampered with the request
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Policy(PolicyError::RequestMutated))
    }
}

/// Shared collaborators every executor needs
#[derive(Clone)]
pub struct EngineContext {
    pub jobs: Arc<JobRegistry>,
    pub policies: PolicyEngine,
    pub policy_config: Arc<PolicyConfigReader>,
    pub estop: Arc<EmergencyStop>,
}

#[derive(Debug, Clone, Copy)]
struct JobSlot {
    block: usize,
    job: usize,
}

/// State machine for one request
pub struct Executor {
    req: Arc<WorkRequest>,
    ctx: EngineContext,
    status: Arc<watch::Sender<WorkStatus>>,
}

impl Executor {
    pub fn new(req: WorkRequest, ctx: EngineContext) -> Self {
        let (status, _) = watch::channel(WorkStatus::pending(&req));
        Self {
            req: Arc::new(req),
            ctx,
            status: Arc::new(status),
        }
    }

    pub fn request(&self) -> &WorkRequest {
        &self.req
    }

    /// Observe status updates; only the latest snapshot is retained
    pub fn subscribe(&self) -> watch::Receiver<WorkStatus> {
        self.status.subscribe()
    }

    /// Current status snapshot
    pub fn status(&self) -> WorkStatus {
        self.status.borrow().clone()
    }

    /// Structural checks, per-job argument checks, then the workflow's
    /// bound policies. Nothing changes state.
    #[instrument(skip_all, fields(workflow = %self.req.name))]
    pub async fn validate(&self, cancel: &CancellationToken) -> Result<(), ValidationError> {
        if self.req.blocks.is_empty() {
            return Err(ValidationError::NoBlocks);
        }

        for (block_index, block) in self.req.blocks.iter().enumerate() {
            if block.jobs.is_empty() {
                return Err(ValidationError::EmptyBlock { block: block_index });
            }

            for (index, job) in block.jobs.iter().enumerate() {
                let plugin =
                    self.ctx
                        .jobs
                        .get(&job.name)
                        .map_err(|_| ValidationError::UnknownJob {
                            block: block_index,
                            index,
                            name: job.name.clone(),
                        })?;

                plugin
                    .validate(job)
                    .map_err(|source| ValidationError::InvalidJob {
                        block: block_index,
                        index,
                        name: job.name.clone(),
                        source,
                    })?;
            }
        }

        let read = self.ctx.policy_config.read();
        if let Some(stale) = &read.reload_error {
            warn!(error = %stale, "Validating against stale policy config");
        }

        let bindings = read
            .config
            .bindings(&self.req.name)
            .ok_or_else(|| ValidationError::NoPolicyBinding(self.req.name.clone()))?;

        self.ctx.policies.run(cancel, &self.req, bindings).await?;
        Ok(())
    }

    /// Execute the request and return its final status.
    ///
    /// `cancel` stops the run cooperatively; jobs observe it through their
    /// own tokens.
    #[instrument(skip_all, fields(workflow = %self.req.name))]
    pub async fn run(self, cancel: CancellationToken) -> WorkStatus {
        let (mut stop_rx, subscription) = self.ctx.estop.subscribe(&self.req.name);
        self.update(|s| s.started_at = Some(Utc::now()));

        if stop_rx.recv().await != Some(StopStatus::Go) {
            warn!("Workflow is emergency stopped, not starting");
            self.update(|s| {
                s.status.advance(Status::Failed);
                s.was_emergency_stopped = true;
                s.error = Some("emergency stop is active".to_string());
                s.finished_at = Some(Utc::now());
            });
            return self.status();
        }

        info!(blocks = self.req.blocks.len(), "Run started");
        self.update(|s| {
            s.status.advance(Status::Running);
        });

        let run_token = cancel.child_token();
        let stopped = Arc::new(AtomicBool::new(false));
        let watcher = {
            let run_token = run_token.clone();
            let stopped = Arc::clone(&stopped);
            tokio::spawn(async move {
                tokio::select! {
                    _ = run_token.cancelled() => {}
                    msg = stop_rx.recv() => {
                        if msg != Some(StopStatus::Go) {
                            warn!("Emergency stop received, cancelling run");
                            stopped.store(true, Ordering::SeqCst);
                            run_token.cancel();
                        }
                    }
                }
            })
        };

        for index in 0..self.req.blocks.len() {
            if run_token.is_cancelled() {
                break;
            }
            if !self.run_block(index, &run_token).await {
                break;
            }
        }

        watcher.abort();
        drop(subscription);

        let emergency = stopped.load(Ordering::SeqCst);
        let cancelled = cancel.is_cancelled();
        self.update(|s| {
            let all_completed = s.blocks.iter().all(|b| b.status == Status::Completed);
            let had_errors = s.jobs().any(|j| j.status == Status::Failed);
            s.had_errors = had_errors;

            if all_completed {
                s.status.advance(Status::Completed);
            } else {
                s.status.advance(Status::Failed);
                s.error = Some(if emergency {
                    s.was_emergency_stopped = true;
                    "halted by emergency stop".to_string()
                } else if cancelled {
                    "run cancelled".to_string()
                } else {
                    let failed = s
                        .blocks
                        .iter()
                        .position(|b| b.status == Status::Failed)
                        .unwrap_or_default();
                    format!("block {failed} failed")
                });
            }
            s.finished_at = Some(Utc::now());
        });

        let status = self.status();
        info!(status = %status.status, had_errors = status.had_errors, "Run finished");
        status
    }

    /// Run one block; returns true if it completed
    async fn run_block(&self, index: usize, run_token: &CancellationToken) -> bool {
        let block = &self.req.blocks[index];
        let limit = block.effective_rate_limit();
        debug!(block = index, jobs = block.jobs.len(), limit, "Block started");

        self.update(|s| {
            s.blocks[index].status.advance(Status::Running);
        });

        let block_token = run_token.child_token();
        let permits = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for (job_index, job) in block.jobs.iter().enumerate() {
            let slot = JobSlot {
                block: index,
                job: job_index,
            };

            let plugin = match self.ctx.jobs.get(&job.name) {
                Ok(plugin) => plugin,
                Err(e) => {
                    set_job(&self.status, slot, Status::Failed, Some(e.to_string()));
                    continue;
                }
            };

            tasks.spawn(run_job(
                slot,
                Arc::clone(&self.req),
                plugin,
                Arc::clone(&self.status),
                Arc::clone(&permits),
                block_token.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(block = index, error = %e, "Job task panicked");
            }
        }

        let mut completed = false;
        self.status.send_modify(|s| {
            let block = &mut s.blocks[index];

            // Only a panicked task can leave a job running here
            for job in block.jobs.iter_mut() {
                if job.status == Status::Running {
                    job.status.advance(Status::Failed);
                    job.error = Some("job did not finish".to_string());
                }
            }

            let failed = block
                .jobs
                .iter()
                .filter(|j| j.status == Status::Failed)
                .count();
            completed = block.jobs.iter().all(|j| j.status == Status::Completed);

            if completed {
                block.status.advance(Status::Completed);
            } else {
                block.status.advance(Status::Failed);
                block.error = Some(if failed > 0 {
                    format!("{failed} of {} jobs failed", block.jobs.len())
                } else {
                    "cancelled before all jobs ran".to_string()
                });
            }
        });

        debug!(block = index, completed, "Block finished");
        completed
    }

    fn update(&self, f: impl FnOnce(&mut WorkStatus)) {
        self.status.send_modify(f);
    }
}

fn set_job(
    status: &watch::Sender<WorkStatus>,
    slot: JobSlot,
    next: Status,
    error: Option<String>,
) {
    status.send_modify(|s| {
        let job = &mut s.blocks[slot.block].jobs[slot.job];
        if job.status.advance(next) && error.is_some() {
            job.error = error;
        }
    });
}

async fn run_job(
    slot: JobSlot,
    req: Arc<WorkRequest>,
    plugin: Arc<dyn JobPlugin>,
    status: Arc<watch::Sender<WorkStatus>>,
    permits: Arc<Semaphore>,
    token: CancellationToken,
) {
    let job = &req.blocks[slot.block].jobs[slot.job];

    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(block = slot.block, job = slot.job, "Job skipped, block cancelled");
            return;
        }
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    // Acquire-then-check: a job never starts after cancellation is visible
    if token.is_cancelled() {
        debug!(block = slot.block, job = slot.job, "Job skipped, block cancelled");
        return;
    }

    set_job(&status, slot, Status::Running, None);
    let result = plugin.run(token.clone(), job).await;

    match result {
        Ok(()) => set_job(&status, slot, Status::Completed, None),
        Err(e) => {
            if e.is_fatal() {
                error!(block = slot.block, job = slot.job, name = %job.name, error = %e, "Fatal job error, cancelling block");
            } else {
                warn!(block = slot.block, job = slot.job, name = %job.name, error = %e, "Job failed");
            }
            set_job(&status, slot, Status::Failed, Some(e.to_string()));
            if e.is_fatal() {
                token.cancel();
            }
        }
    }
}
