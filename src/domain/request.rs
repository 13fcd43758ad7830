//! Work requests submitted by clients.
//!
//! A request is an ordered list of blocks; each block is a group of jobs
//! that run concurrently up to the block's rate limit.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A named workflow instance submitted for execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Workflow name (must have an entry in the policy configuration)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub desc: String,

    /// Blocks, executed strictly in order
    pub blocks: Vec<Block>,
}

impl WorkRequest {
    /// Load a request from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a request from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse work request YAML")
    }

    /// Iterate over every job in the request, in block order
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.blocks.iter().flat_map(|b| b.jobs.iter())
    }
}

/// A group of jobs run concurrently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub desc: String,

    /// Maximum number of jobs from this block running at once (<1 means 1)
    #[serde(default)]
    pub rate_limit: i32,

    pub jobs: Vec<Job>,
}

impl Block {
    /// Concurrency limit actually applied to this block
    pub fn effective_rate_limit(&self) -> usize {
        usize::try_from(self.rate_limit.max(1)).unwrap_or(1)
    }
}

/// A single unit of work, resolved by name in the job registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,

    #[serde(default)]
    pub desc: String,

    /// Plugin-defined arguments; values are strings the plugin interprets
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl Job {
    /// Create a job with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument (builder style)
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Look up an argument value
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO_YAML: &str = r#"
name: Demo
desc: three sleeps
blocks:
  - desc: first
    rate_limit: 2
    jobs:
      - name: sleep
        args:
          seconds: "1"
      - name: sleep
        args:
          seconds: "2"
  - jobs:
      - name: fail
"#;

    #[test]
    fn test_request_parsing() {
        let req = WorkRequest::from_yaml(DEMO_YAML).unwrap();

        assert_eq!(req.name, "Demo");
        assert_eq!(req.blocks.len(), 2);
        assert_eq!(req.blocks[0].rate_limit, 2);
        assert_eq!(req.blocks[0].jobs[1].arg("seconds"), Some("2"));
        assert_eq!(req.blocks[1].desc, "");
        assert!(req.blocks[1].jobs[0].args.is_empty());
        assert_eq!(req.jobs().count(), 3);
    }

    #[test]
    fn test_rate_limit_clamps_to_one() {
        let mut block = Block {
            desc: String::new(),
            rate_limit: 0,
            jobs: vec![Job::new("sleep")],
        };
        assert_eq!(block.effective_rate_limit(), 1);

        block.rate_limit = -5;
        assert_eq!(block.effective_rate_limit(), 1);

        block.rate_limit = 4;
        assert_eq!(block.effective_rate_limit(), 4);
    }
}
