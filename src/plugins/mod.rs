//! Built-in job and policy plugins.
//!
//! Deployments register their own plugins at startup; these cover the
//! common cases and back the CLI and the test suites.

pub mod jobs;
pub mod policies;

use crate::core::{JobRegistry, PolicyRegistry};

pub use jobs::{FailJob, SleepJob};
pub use policies::{
    AllowedJobs, AllowedJobsPolicy, JobPosition, JobPositionPolicy, Position, SameArgs,
    SameArgsPolicy,
};

/// Register every built-in plugin under its conventional name
pub fn register_builtin(jobs: &mut JobRegistry, policies: &mut PolicyRegistry) {
    jobs.register("sleep", SleepJob);
    jobs.register("fail", FailJob);

    policies.register("allowed_jobs", AllowedJobsPolicy);
    policies.register("same_args", SameArgsPolicy);
    policies.register("job_position", JobPositionPolicy);
}
