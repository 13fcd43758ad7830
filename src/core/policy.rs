//! Policy registry and the concurrent policy engine.
//!
//! A policy is a compliance check run against a request before it may be
//! executed. Each policy declares a typed settings struct; the registry
//! erases the type so bindings for different policies can live side by side
//! in one configuration, and recovers it again when the policy runs.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::domain::WorkRequest;

use super::jobs::{JobRegistry, RegistryError};

/// Policy evaluation and configuration errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    NotRegistered(#[from] RegistryError),

    #[error("invalid settings for policy {policy:?}: {reason}")]
    InvalidSettings { policy: String, reason: String },

    #[error("policy {policy:?} rejected the request: {reason}")]
    Rejected { policy: String, reason: String },

    #[error("policy task failed: {0}")]
    Panicked(String),

    /// A policy changed the request it was evaluating. This is a security
    /// violation, not an ordinary rejection.
    #[error("a policy modified the request under evaluation")]
    RequestMutated,
}

/// Settings attached to a policy binding.
///
/// Settings are plain owned values: they deserialize from configuration,
/// clone without aliasing, and are checked once at load time.
pub trait PolicySettings: DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Semantic validation, run when the configuration is loaded
    fn validate(&self, _jobs: &JobRegistry) -> anyhow::Result<()> {
        Ok(())
    }
}

impl PolicySettings for () {}

/// A compliance check over a whole request.
///
/// `run` must be a pure function of the request and settings and must not
/// keep references to either past the call.
#[async_trait]
pub trait Policy: Send + Sync + 'static {
    type Settings: PolicySettings;

    async fn run(
        &self,
        cancel: CancellationToken,
        req: &WorkRequest,
        settings: &Self::Settings,
    ) -> anyhow::Result<()>;
}

type SettingsHandle = Arc<dyn Any + Send + Sync>;

#[async_trait]
trait ErasedPolicy: Send + Sync {
    fn load(&self, raw: serde_yaml::Value, jobs: &JobRegistry) -> anyhow::Result<SettingsHandle>;

    fn check(&self, settings: &SettingsHandle, jobs: &JobRegistry) -> anyhow::Result<()>;

    async fn run(
        &self,
        cancel: CancellationToken,
        req: &WorkRequest,
        settings: &SettingsHandle,
    ) -> anyhow::Result<()>;
}

struct Typed<P>(P);

#[async_trait]
impl<P: Policy> ErasedPolicy for Typed<P> {
    fn load(&self, raw: serde_yaml::Value, jobs: &JobRegistry) -> anyhow::Result<SettingsHandle> {
        let settings: P::Settings =
            serde_yaml::from_value(raw).context("settings do not match the policy's schema")?;
        settings.validate(jobs)?;
        Ok(Arc::new(settings))
    }

    fn check(&self, settings: &SettingsHandle, jobs: &JobRegistry) -> anyhow::Result<()> {
        (**settings)
            .downcast_ref::<P::Settings>()
            .ok_or_else(|| anyhow!("settings are not of this policy's type"))?
            .validate(jobs)
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        req: &WorkRequest,
        settings: &SettingsHandle,
    ) -> anyhow::Result<()> {
        let settings = (**settings)
            .downcast_ref::<P::Settings>()
            .ok_or_else(|| anyhow!("settings were built for a different policy"))?;
        self.0.run(cancel, req, settings).await
    }
}

/// A policy name bound to validated settings
#[derive(Clone)]
pub struct PolicyArg {
    name: String,
    settings: SettingsHandle,
}

impl PolicyArg {
    /// Unchecked binding, for exercising the engine's own checks
    #[cfg(test)]
    pub(crate) fn unchecked<S: PolicySettings>(name: impl Into<String>, settings: S) -> Self {
        Self {
            name: name.into(),
            settings: Arc::new(settings),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Debug for PolicyArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyArg")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Name to policy lookup
#[derive(Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<dyn ErasedPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy under `name`.
    ///
    /// The settings type is fixed by `P::Settings`; its trait bounds make it
    /// an owned value that can be copied freely.
    ///
    /// # Panics
    ///
    /// If `name` is empty or already registered.
    pub fn register<P: Policy>(&mut self, name: &str, policy: P) {
        assert!(!name.is_empty(), "policy name must not be empty");
        assert!(
            !self.policies.contains_key(name),
            "policy {name:?} is already registered"
        );

        self.policies
            .insert(name.to_string(), Arc::new(Typed(policy)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Deserialize and validate raw settings for the policy `name`
    pub fn load_settings(
        &self,
        name: &str,
        raw: serde_yaml::Value,
        jobs: &JobRegistry,
    ) -> Result<PolicyArg, PolicyError> {
        let policy = self.get(name)?;
        let settings = policy
            .load(raw, jobs)
            .map_err(|e| PolicyError::InvalidSettings {
                policy: name.to_string(),
                reason: format!("{e:#}"),
            })?;

        Ok(PolicyArg {
            name: name.to_string(),
            settings,
        })
    }

    /// Bind typed settings to the policy `name`, with the same checks
    /// [`PolicyRegistry::load_settings`] applies to configuration files
    pub fn bind<S: PolicySettings>(
        &self,
        name: &str,
        settings: S,
        jobs: &JobRegistry,
    ) -> Result<PolicyArg, PolicyError> {
        let policy = self.get(name)?;
        let settings: SettingsHandle = Arc::new(settings);
        policy
            .check(&settings, jobs)
            .map_err(|e| PolicyError::InvalidSettings {
                policy: name.to_string(),
                reason: format!("{e:#}"),
            })?;

        Ok(PolicyArg {
            name: name.to_string(),
            settings,
        })
    }

    fn get(&self, name: &str) -> Result<Arc<dyn ErasedPolicy>, RegistryError> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::PolicyNotFound(name.to_string()))
    }
}

/// Runs a set of policy bindings concurrently against a request
#[derive(Clone)]
pub struct PolicyEngine {
    registry: Arc<PolicyRegistry>,
}

impl PolicyEngine {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    /// Evaluate every binding against a private copy of `req`.
    ///
    /// The first failure cancels the remaining policies and is returned with
    /// the policy's name. Once evaluation stops the copy is compared with
    /// `req`; any difference is reported as [`PolicyError::RequestMutated`].
    #[instrument(skip_all, fields(workflow = %req.name, policies = args.len()))]
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        req: &WorkRequest,
        args: &[PolicyArg],
    ) -> Result<(), PolicyError> {
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            resolved.push((
                arg.name.clone(),
                self.registry.get(&arg.name)?,
                Arc::clone(&arg.settings),
            ));
        }

        let evaluated = Arc::new(req.clone());
        let token = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (name, policy, settings) in resolved {
            let req = Arc::clone(&evaluated);
            let token = token.clone();
            tasks.spawn(async move {
                let result = policy.run(token, &req, &settings).await;
                (name, result)
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(policy = %name, "policy passed"),
                Ok((name, Err(e))) => {
                    warn!(policy = %name, error = %e, "policy rejected request");
                    failure = Some(PolicyError::Rejected {
                        policy: name,
                        reason: format!("{e:#}"),
                    });
                    break;
                }
                Err(e) => {
                    failure = Some(PolicyError::Panicked(e.to_string()));
                    break;
                }
            }
        }

        if failure.is_some() {
            token.cancel();
            tasks.shutdown().await;
        }

        verify_unmodified(req, &evaluated)?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Compare a request before and after evaluation
pub fn verify_unmodified(original: &WorkRequest, evaluated: &WorkRequest) -> Result<(), PolicyError> {
    if original != evaluated {
        error!(workflow = %original.name, "request was modified during policy evaluation");
        return Err(PolicyError::RequestMutated);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde::Deserialize;

    use super::*;
    use crate::domain::{Block, Job};

    #[derive(Debug, Clone, Deserialize)]
    struct MaxJobs {
        max: usize,
    }

    impl PolicySettings for MaxJobs {
        fn validate(&self, _jobs: &JobRegistry) -> anyhow::Result<()> {
            if self.max == 0 {
                anyhow::bail!("max must be at least 1");
            }
            Ok(())
        }
    }

    struct MaxJobsPolicy;

    #[async_trait]
    impl Policy for MaxJobsPolicy {
        type Settings = MaxJobs;

        async fn run(
            &self,
            _cancel: CancellationToken,
            req: &WorkRequest,
            settings: &MaxJobs,
        ) -> anyhow::Result<()> {
            let count = req.jobs().count();
            if count > settings.max {
                anyhow::bail!("{count} jobs exceeds limit of {}", settings.max);
            }
            Ok(())
        }
    }

    /// Waits for cancellation, or a long time
    struct SlowPolicy;

    #[async_trait]
    impl Policy for SlowPolicy {
        type Settings = ();

        async fn run(
            &self,
            cancel: CancellationToken,
            _req: &WorkRequest,
            _settings: &(),
        ) -> anyhow::Result<()> {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
            }
        }
    }

    fn registry() -> Arc<PolicyRegistry> {
        let mut registry = PolicyRegistry::new();
        registry.register("max_jobs", MaxJobsPolicy);
        registry.register("slow", SlowPolicy);
        Arc::new(registry)
    }

    fn request(jobs: usize) -> WorkRequest {
        WorkRequest {
            name: "Demo".to_string(),
            desc: String::new(),
            blocks: vec![Block {
                desc: String::new(),
                rate_limit: 1,
                jobs: (0..jobs).map(|_| Job::new("sleep")).collect(),
            }],
        }
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_policy_panics() {
        let mut registry = PolicyRegistry::new();
        registry.register("slow", SlowPolicy);
        registry.register("slow", SlowPolicy);
    }

    #[test]
    fn test_load_settings_validates() {
        let registry = registry();
        let jobs = JobRegistry::new();

        let raw: serde_yaml::Value = serde_yaml::from_str("max: 2").unwrap();
        let arg = registry.load_settings("max_jobs", raw, &jobs).unwrap();
        assert_eq!(arg.name(), "max_jobs");

        let zero: serde_yaml::Value = serde_yaml::from_str("max: 0").unwrap();
        let err = registry.load_settings("max_jobs", zero, &jobs).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSettings { .. }));

        let wrong: serde_yaml::Value = serde_yaml::from_str("limit: 2").unwrap();
        assert!(registry.load_settings("max_jobs", wrong, &jobs).is_err());

        let err = registry
            .load_settings("missing", serde_yaml::Value::Null, &jobs)
            .unwrap_err();
        assert!(matches!(err, PolicyError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_engine_passes() {
        let engine = PolicyEngine::new(registry());
        let args = vec![registry()
            .bind("max_jobs", MaxJobs { max: 3 }, &JobRegistry::new())
            .unwrap()];

        let result = engine
            .run(&CancellationToken::new(), &request(3), &args)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_first_failure_cancels_slow_policies() {
        let engine = PolicyEngine::new(registry());
        let args = vec![
            PolicyArg::unchecked("slow", ()),
            PolicyArg::unchecked("max_jobs", MaxJobs { max: 1 }),
        ];

        let start = Instant::now();
        let err = engine
            .run(&CancellationToken::new(), &request(2), &args)
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            PolicyError::Rejected { policy, reason } => {
                assert_eq!(policy, "max_jobs");
                assert!(reason.contains("exceeds limit"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_settings_are_rejected() {
        let engine = PolicyEngine::new(registry());
        let args = vec![PolicyArg::unchecked("max_jobs", ())];

        let err = engine
            .run(&CancellationToken::new(), &request(1), &args)
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Rejected { .. }));
    }

    #[test]
    fn test_bind_checks_settings() {
        let registry = registry();
        let jobs = JobRegistry::new();

        let arg = registry.bind("max_jobs", MaxJobs { max: 2 }, &jobs).unwrap();
        assert_eq!(arg.name(), "max_jobs");

        let err = registry.bind("max_jobs", MaxJobs { max: 0 }, &jobs).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSettings { .. }));

        let err = registry.bind("max_jobs", (), &jobs).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSettings { ref policy, .. } if policy == "max_jobs"));

        let err = registry.bind("missing", (), &jobs).unwrap_err();
        assert!(matches!(err, PolicyError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_unknown_binding_fails_before_running() {
        let engine = PolicyEngine::new(registry());

        let err = engine
            .run(
                &CancellationToken::new(),
                &request(1),
                &[PolicyArg::unchecked("missing", ())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::NotRegistered(_)));
    }

    #[test]
    fn test_verify_unmodified_detects_changes() {
        let original = request(2);
        let mut copy = original.clone();
        assert!(verify_unmodified(&original, &copy).is_ok());

        copy.blocks[0].jobs[1].args.insert("seconds".to_string(), "9".to_string());
        assert!(matches!(
            verify_unmodified(&original, &copy),
            Err(PolicyError::RequestMutated)
        ));
    }
}
