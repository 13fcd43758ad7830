//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use blockflow::core::{
    EmergencyStop, EngineContext, JobError, JobPlugin, JobRegistry, PolicyConfig,
    PolicyConfigReader, PolicyEngine, PolicyRegistry, Service, StopEntry,
};
use blockflow::domain::{Block, Job, Status, WorkRequest, WorkStatus};
use blockflow::plugins::{self, AllowedJobs};

/// Tracks how many `probe` jobs run at once
#[derive(Debug, Default)]
pub struct ProbeStats {
    current: AtomicUsize,
    max: AtomicUsize,
    runs: AtomicUsize,
}

impl ProbeStats {
    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Sleeps briefly while recording concurrency
pub struct ProbeJob(pub Arc<ProbeStats>);

#[async_trait]
impl JobPlugin for ProbeJob {
    fn validate(&self, _job: &Job) -> Result<(), JobError> {
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken, _job: &Job) -> Result<(), JobError> {
        let stats = &self.0;
        let now = stats.current.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max.fetch_max(now, Ordering::SeqCst);
        stats.runs.fetch_add(1, Ordering::SeqCst);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(30)) => Ok(()),
        };

        stats.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Everything a test needs to drive the engine
pub struct Harness {
    pub ctx: EngineContext,
    pub estop: Arc<EmergencyStop>,
    pub probe: Arc<ProbeStats>,
}

/// Builtin plugins plus `probe`, with `workflow` allowed to run `allowed`
pub fn harness(workflow: &str, allowed: &[&str]) -> Harness {
    let probe = Arc::new(ProbeStats::default());

    let mut jobs = JobRegistry::new();
    let mut policies = PolicyRegistry::new();
    plugins::register_builtin(&mut jobs, &mut policies);
    jobs.register("probe", ProbeJob(Arc::clone(&probe)));

    let config = PolicyConfig::new().with_workflow(
        workflow,
        vec![policies
            .bind(
                "allowed_jobs",
                AllowedJobs {
                    jobs: allowed.iter().map(|s| s.to_string()).collect(),
                },
                &jobs,
            )
            .unwrap()],
    );

    let estop = Arc::new(EmergencyStop::from_entries([StopEntry::go(workflow)]).unwrap());

    let ctx = EngineContext {
        jobs: Arc::new(jobs),
        policies: PolicyEngine::new(Arc::new(policies)),
        policy_config: Arc::new(PolicyConfigReader::fixed(config)),
        estop: Arc::clone(&estop),
    };

    Harness { ctx, estop, probe }
}

pub fn block(rate_limit: i32, jobs: Vec<Job>) -> Block {
    Block {
        desc: String::new(),
        rate_limit,
        jobs,
    }
}

pub fn request(name: &str, blocks: Vec<Block>) -> WorkRequest {
    WorkRequest {
        name: name.to_string(),
        desc: "integration test".to_string(),
        blocks,
    }
}

pub fn sleep(seconds: &str) -> Job {
    Job::new("sleep").with_arg("seconds", seconds)
}

pub fn fail(fatal: bool) -> Job {
    Job::new("fail").with_arg("fatal", fatal.to_string())
}

/// Poll the service until the run reaches a terminal state and has left
/// the active table, so its final status is on disk
pub async fn wait_finished(service: &Service, id: uuid::Uuid) -> WorkStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let status = service.status(id).await.unwrap();
        if status.is_finished() && service.active_count().await == 0 {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {id} did not finish: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Lifecycle order used to check that observed status never moves back
pub fn rank(status: Status) -> u8 {
    match status {
        Status::NotStarted => 0,
        Status::Running => 1,
        Status::Failed | Status::Completed => 2,
    }
}
