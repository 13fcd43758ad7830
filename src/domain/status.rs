//! Execution status mirroring the request tree.
//!
//! Every node (workflow, block, job) moves through
//! `NotStarted -> Running -> {Completed | Failed}` and never backwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::WorkRequest;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStarted,
    Running,
    Failed,
    Completed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 1,
            Self::Failed | Self::Completed => 2,
        }
    }

    /// Move to `next` only if that is a forward transition.
    ///
    /// Returns false (and leaves `self` untouched) for regressions and for
    /// attempts to leave a terminal state.
    pub fn advance(&mut self, next: Status) -> bool {
        if next.rank() > self.rank() {
            *self = next;
            true
        } else {
            false
        }
    }

    /// Terminal status of a parent given its children: failed iff any child failed
    pub fn rollup(children: impl IntoIterator<Item = Status>) -> Status {
        if children.into_iter().any(|s| s == Status::Failed) {
            Status::Failed
        } else {
            Status::Completed
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::Failed => "failed",
            Status::Completed => "completed",
        };
        f.pad(s)
    }
}

/// Status of a whole work request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStatus {
    pub name: String,
    pub desc: String,
    pub status: Status,

    /// Error summary for the workflow, if any
    pub error: Option<String>,

    /// At least one job failed
    pub had_errors: bool,

    /// The run was halted (or refused) by the emergency stop
    pub was_emergency_stopped: bool,

    pub blocks: Vec<BlockStatus>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkStatus {
    /// Initial status tree for a request: every node `NotStarted`
    pub fn pending(req: &WorkRequest) -> Self {
        Self {
            name: req.name.clone(),
            desc: req.desc.clone(),
            status: Status::NotStarted,
            error: None,
            had_errors: false,
            was_emergency_stopped: false,
            blocks: req
                .blocks
                .iter()
                .map(|block| BlockStatus {
                    desc: block.desc.clone(),
                    status: Status::NotStarted,
                    error: None,
                    jobs: block
                        .jobs
                        .iter()
                        .map(|job| JobStatus {
                            name: job.name.clone(),
                            desc: job.desc.clone(),
                            args: job.args.clone(),
                            status: Status::NotStarted,
                            error: None,
                        })
                        .collect(),
                })
                .collect(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// All job statuses in block order
    pub fn jobs(&self) -> impl Iterator<Item = &JobStatus> {
        self.blocks.iter().flat_map(|b| b.jobs.iter())
    }
}

/// Status of a single block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub desc: String,
    pub status: Status,
    pub error: Option<String>,
    pub jobs: Vec<JobStatus>,
}

/// Status of a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub desc: String,
    pub args: BTreeMap<String, String>,
    pub status: Status,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::{Block, Job};

    #[test]
    fn test_advance_is_monotonic() {
        let mut status = Status::NotStarted;

        assert!(status.advance(Status::Running));
        assert!(!status.advance(Status::NotStarted));
        assert!(status.advance(Status::Completed));
        assert!(!status.advance(Status::Running));
        assert!(!status.advance(Status::Failed));
        assert_eq!(status, Status::Completed);
    }

    #[test]
    fn test_skipping_running_is_allowed() {
        let mut status = Status::NotStarted;
        assert!(status.advance(Status::Failed));
        assert_eq!(status, Status::Failed);
    }

    #[test]
    fn test_rollup() {
        assert_eq!(
            Status::rollup([Status::Completed, Status::Completed]),
            Status::Completed
        );
        assert_eq!(
            Status::rollup([Status::Completed, Status::Failed, Status::NotStarted]),
            Status::Failed
        );
        assert_eq!(Status::rollup([]), Status::Completed);
    }

    #[test]
    fn test_pending_mirrors_request() {
        let req = WorkRequest {
            name: "Demo".to_string(),
            desc: "demo".to_string(),
            blocks: vec![
                Block {
                    desc: "b0".to_string(),
                    rate_limit: 1,
                    jobs: vec![Job::new("sleep").with_arg("seconds", "1"), Job::new("fail")],
                },
                Block {
                    desc: "b1".to_string(),
                    rate_limit: 1,
                    jobs: vec![Job::new("sleep")],
                },
            ],
        };

        let status = WorkStatus::pending(&req);

        assert_eq!(status.name, "Demo");
        assert_eq!(status.blocks.len(), 2);
        assert_eq!(status.blocks[0].jobs.len(), 2);
        assert_eq!(status.blocks[0].jobs[0].args.get("seconds").unwrap(), "1");
        assert!(status.jobs().all(|j| j.status == Status::NotStarted));
        assert!(!status.is_finished());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Status::NotStarted).unwrap();
        assert_eq!(json, "\"not_started\"");

        let parsed: Status = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, Status::Completed);
    }
}
