//! Per-workflow policy bindings loaded from a YAML document.
//!
//! ```yaml
//! Demo:
//!   - policy: allowed_jobs
//!     settings:
//!       jobs: [sleep]
//! ```
//!
//! The document is re-read on a fixed interval. A reload that fails keeps
//! the last good configuration in service and reports the failure through
//! [`PolicyConfigReader::read`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::jobs::JobRegistry;
use super::policy::{PolicyArg, PolicyError, PolicyRegistry};
use super::reload::spawn_periodic;

/// Failure to load the policy configuration
#[derive(Debug, Error)]
pub enum PolicyConfigError {
    #[error("failed to read policy config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("workflow {workflow:?}: {source}")]
    Binding {
        workflow: String,
        #[source]
        source: PolicyError,
    },
}

#[derive(Debug, Deserialize)]
struct RawBinding {
    policy: String,
    #[serde(default)]
    settings: serde_yaml::Value,
}

/// Validated policy bindings keyed by workflow name
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    bindings: HashMap<String, Vec<PolicyArg>>,
}

impl PolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the bindings for a workflow
    pub fn with_workflow(mut self, workflow: impl Into<String>, args: Vec<PolicyArg>) -> Self {
        self.bindings.insert(workflow.into(), args);
        self
    }

    /// Parse and validate a configuration document.
    ///
    /// Every binding must name a registered policy and carry settings that
    /// pass that policy's validation; one bad entry fails the whole document.
    pub fn parse(
        content: &str,
        policies: &PolicyRegistry,
        jobs: &JobRegistry,
    ) -> Result<Self, PolicyConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: HashMap<String, Vec<RawBinding>> = serde_yaml::from_str(content)?;
        let mut bindings = HashMap::with_capacity(raw.len());

        for (workflow, entries) in raw {
            let mut args = Vec::with_capacity(entries.len());
            for entry in entries {
                let arg = policies
                    .load_settings(&entry.policy, entry.settings, jobs)
                    .map_err(|source| PolicyConfigError::Binding {
                        workflow: workflow.clone(),
                        source,
                    })?;
                args.push(arg);
            }
            bindings.insert(workflow, args);
        }

        Ok(Self { bindings })
    }

    /// Bindings for a workflow, in configured order
    pub fn bindings(&self, workflow: &str) -> Option<&[PolicyArg]> {
        self.bindings.get(workflow).map(Vec::as_slice)
    }

    /// Configured workflow names, sorted
    pub fn workflows(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Result of [`PolicyConfigReader::read`]
#[derive(Debug, Clone)]
pub struct PolicyConfigRead {
    /// Always usable: the latest configuration that loaded cleanly
    pub config: Arc<PolicyConfig>,

    /// Set when the most recent reload failed, i.e. `config` may be stale
    pub reload_error: Option<String>,
}

struct Source {
    path: PathBuf,
    policies: Arc<PolicyRegistry>,
    jobs: Arc<JobRegistry>,
}

struct ReaderState {
    source: Option<Source>,
    snapshot: RwLock<PolicyConfigRead>,
}

impl ReaderState {
    async fn reload(&self) -> Result<(), PolicyConfigError> {
        let Some(source) = &self.source else {
            return Ok(());
        };

        match load_file(source).await {
            Ok(config) => {
                let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
                *snapshot = PolicyConfigRead {
                    config: Arc::new(config),
                    reload_error: None,
                };
                Ok(())
            }
            Err(e) => {
                warn!(path = %source.path.display(), error = %e, "Policy config reload failed, keeping last good config");
                let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
                snapshot.reload_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}

async fn load_file(source: &Source) -> Result<PolicyConfig, PolicyConfigError> {
    let content = tokio::fs::read_to_string(&source.path)
        .await
        .map_err(|e| PolicyConfigError::Io {
            path: source.path.clone(),
            source: e,
        })?;

    PolicyConfig::parse(&content, &source.policies, &source.jobs)
}

/// Serves the current policy configuration and keeps it fresh
pub struct PolicyConfigReader {
    state: Arc<ReaderState>,
    shutdown: CancellationToken,
}

impl PolicyConfigReader {
    /// Load the configuration from `path`; the initial load must succeed
    #[instrument(skip(policies, jobs))]
    pub async fn load(
        path: &Path,
        policies: Arc<PolicyRegistry>,
        jobs: Arc<JobRegistry>,
    ) -> Result<Self, PolicyConfigError> {
        let source = Source {
            path: path.to_path_buf(),
            policies,
            jobs,
        };
        let config = load_file(&source).await?;
        info!(workflows = config.bindings.len(), "Loaded policy config");

        Ok(Self::with_state(Some(source), config))
    }

    /// A reader over a fixed configuration that never reloads
    pub fn fixed(config: PolicyConfig) -> Self {
        Self::with_state(None, config)
    }

    fn with_state(source: Option<Source>, config: PolicyConfig) -> Self {
        Self {
            state: Arc::new(ReaderState {
                source,
                snapshot: RwLock::new(PolicyConfigRead {
                    config: Arc::new(config),
                    reload_error: None,
                }),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Re-read the source every `period` until the reader is dropped
    pub fn start_reloading(&self, period: Duration) {
        let state = Arc::clone(&self.state);
        spawn_periodic("policy_config", period, self.shutdown.clone(), move || {
            let state = Arc::clone(&state);
            async move {
                // Failures are recorded in the snapshot
                let _ = state.reload().await;
            }
        });
    }

    /// Re-read the source now
    pub async fn reload(&self) -> Result<(), PolicyConfigError> {
        self.state.reload().await
    }

    pub fn read(&self) -> PolicyConfigRead {
        self.state
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for PolicyConfigReader {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;
    use crate::core::policy::{Policy, PolicySettings};
    use crate::domain::WorkRequest;

    #[derive(Debug, Clone, Deserialize)]
    struct Known {
        job: String,
    }

    impl PolicySettings for Known {
        fn validate(&self, jobs: &JobRegistry) -> anyhow::Result<()> {
            if !jobs.contains(&self.job) {
                anyhow::bail!("unknown job {:?}", self.job);
            }
            Ok(())
        }
    }

    struct KnownPolicy;

    #[async_trait]
    impl Policy for KnownPolicy {
        type Settings = Known;

        async fn run(
            &self,
            _cancel: CancellationToken,
            _req: &WorkRequest,
            _settings: &Known,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registries() -> (Arc<PolicyRegistry>, Arc<JobRegistry>) {
        let mut policies = PolicyRegistry::new();
        policies.register("known", KnownPolicy);

        let mut jobs = JobRegistry::new();
        jobs.register("sleep", crate::plugins::SleepJob);

        (Arc::new(policies), Arc::new(jobs))
    }

    const GOOD: &str = r#"
Demo:
  - policy: known
    settings:
      job: sleep
Other: []
"#;

    #[test]
    fn test_parse_config() {
        let (policies, jobs) = registries();
        let config = PolicyConfig::parse(GOOD, &policies, &jobs).unwrap();

        assert_eq!(config.workflows(), vec!["Demo", "Other"]);
        assert_eq!(config.bindings("Demo").unwrap()[0].name(), "known");
        assert!(config.bindings("Other").unwrap().is_empty());
        assert!(config.bindings("Missing").is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_policy_and_job() {
        let (policies, jobs) = registries();

        let unknown_policy = "Demo:\n  - policy: nope\n";
        assert!(matches!(
            PolicyConfig::parse(unknown_policy, &policies, &jobs),
            Err(PolicyConfigError::Binding { .. })
        ));

        let unknown_job = "Demo:\n  - policy: known\n    settings:\n      job: erase\n";
        let err = PolicyConfig::parse(unknown_job, &policies, &jobs).unwrap_err();
        assert!(err.to_string().contains("Demo"));
    }

    #[test]
    fn test_empty_document_is_empty_config() {
        let (policies, jobs) = registries();
        let config = PolicyConfig::parse("  \n", &policies, &jobs).unwrap();
        assert!(config.workflows().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_last_good_config() {
        let (policies, jobs) = registries();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("policies.yaml");
        std::fs::write(&path, GOOD).unwrap();

        let reader = PolicyConfigReader::load(&path, policies, jobs).await.unwrap();
        assert!(reader.read().reload_error.is_none());

        std::fs::write(&path, "Demo: [ this is not valid").unwrap();
        assert!(reader.reload().await.is_err());

        let read = reader.read();
        assert!(read.reload_error.is_some());
        assert!(read.config.bindings("Demo").is_some());

        std::fs::write(&path, "Fresh: []\n").unwrap();
        reader.reload().await.unwrap();

        let read = reader.read();
        assert!(read.reload_error.is_none());
        assert_eq!(read.config.workflows(), vec!["Fresh"]);
    }

    #[tokio::test]
    async fn test_initial_load_must_succeed() {
        let (policies, jobs) = registries();
        let temp = TempDir::new().unwrap();

        let result =
            PolicyConfigReader::load(&temp.path().join("missing.yaml"), policies, jobs).await;
        assert!(matches!(result, Err(PolicyConfigError::Io { .. })));
    }
}
