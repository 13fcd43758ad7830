//! Configuration for blockflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variable BLOCKFLOW_HOME
//! 2. Config file (.blockflow/config.yaml)
//! 3. Defaults (~/.blockflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .blockflow/config.yaml
//! - `home` is relative to the .blockflow/ directory, the other paths to
//!   the project root (the parent of .blockflow/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::client::{BackoffPolicy, CircuitBreakerConfig, ClientOptions};
use crate::core::ServiceConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".blockflow";
const HOME_ENV: &str = "BLOCKFLOW_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .blockflow/)
    pub home: Option<String>,
    /// Work storage directory
    pub storage: Option<String>,
    /// Policy configuration document
    pub policies: Option<String>,
    /// Emergency-stop document
    pub estop: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSection {
    pub max_in_flight: Option<usize>,
    pub exec_window_seconds: Option<u64>,
    pub reload_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientSection {
    pub deadline_seconds: Option<u64>,
    pub backoff: Option<BackoffPolicy>,
    pub failure_threshold: Option<u32>,
    pub cool_down_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub storage_dir: PathBuf,
    pub policy_file: PathBuf,
    pub estop_file: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub reload_interval: Duration,
    pub service: ServiceConfig,
    pub client: ClientOptions,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine the sources into a resolved configuration
fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env_home: Option<PathBuf>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };

    // .blockflow/ and the project root above it
    let config_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let base_dir = config_dir.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &file.paths.home) {
        (Some(env_home), _) => env_home,
        (None, Some(home)) => resolve_path(config_dir, home),
        (None, None) => default_home,
    };

    let under_base_or_home = |configured: &Option<String>, default: &str| match configured {
        Some(path) => resolve_path(base_dir, path),
        None => home.join(default),
    };
    let storage_dir = under_base_or_home(&file.paths.storage, "work");
    let policy_file = under_base_or_home(&file.paths.policies, "policies.yaml");
    let estop_file = under_base_or_home(&file.paths.estop, "estop.yaml");

    let service_defaults = ServiceConfig::default();
    let service = ServiceConfig {
        max_in_flight: file
            .service
            .max_in_flight
            .unwrap_or(service_defaults.max_in_flight),
        exec_window: file
            .service
            .exec_window_seconds
            .map(Duration::from_secs)
            .unwrap_or(service_defaults.exec_window),
    };
    let reload_interval = Duration::from_secs(file.service.reload_interval_seconds.unwrap_or(10));

    let client_defaults = ClientOptions::default();
    let client = ClientOptions {
        default_deadline: file
            .client
            .deadline_seconds
            .map(Duration::from_secs)
            .unwrap_or(client_defaults.default_deadline),
        backoff: file.client.backoff.unwrap_or(client_defaults.backoff),
        breaker: CircuitBreakerConfig {
            failure_threshold: file
                .client
                .failure_threshold
                .unwrap_or(client_defaults.breaker.failure_threshold),
            cool_down: file
                .client
                .cool_down_seconds
                .map(Duration::from_secs)
                .unwrap_or(client_defaults.breaker.cool_down),
        },
    };

    ResolvedConfig {
        home,
        storage_dir,
        policy_file,
        estop_file,
        config_file: config_path,
        reload_interval,
        service,
        client,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = match find_config_file(&cwd) {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    let env_home = std::env::var_os(HOME_ENV).map(PathBuf::from);
    Ok(resolve(config_file, env_home, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{e:#}")));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, None, PathBuf::from("/users/me/.blockflow"));

        assert_eq!(config.home, PathBuf::from("/users/me/.blockflow"));
        assert_eq!(config.storage_dir, PathBuf::from("/users/me/.blockflow/work"));
        assert_eq!(
            config.policy_file,
            PathBuf::from("/users/me/.blockflow/policies.yaml")
        );
        assert_eq!(config.estop_file, PathBuf::from("/users/me/.blockflow/estop.yaml"));
        assert_eq!(config.reload_interval, Duration::from_secs(10));
        assert_eq!(config.service.max_in_flight, 10);
        assert_eq!(config.client.default_deadline, Duration::from_secs(30));
        assert_eq!(config.client.breaker.failure_threshold, 3);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_env_home_wins() {
        let file = ConfigFile {
            paths: PathsConfig {
                home: Some("state".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = resolve(
            Some((PathBuf::from("/proj/.blockflow/config.yaml"), file)),
            Some(PathBuf::from("/srv/flow")),
            PathBuf::from("/users/me/.blockflow"),
        );

        assert_eq!(config.home, PathBuf::from("/srv/flow"));
        assert_eq!(config.storage_dir, PathBuf::from("/srv/flow/work"));
    }

    #[test]
    fn test_config_file_discovery_and_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".blockflow");
        std::fs::create_dir_all(&config_dir).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  storage: /var/lib/blockflow
  policies: policies.yaml
service:
  max_in_flight: 4
  reload_interval_seconds: 2
client:
  deadline_seconds: 5
  backoff:
    initial_delay_ms: 50
"#
        )
        .unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_path);

        let parsed = load_config_file(&found).unwrap();
        let config = resolve(Some((found, parsed)), None, PathBuf::from("/default"));

        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/blockflow"));
        assert_eq!(config.policy_file, temp.path().join("policies.yaml"));
        assert_eq!(config.estop_file, PathBuf::from("/default/estop.yaml"));
        assert_eq!(config.service.max_in_flight, 4);
        assert_eq!(config.reload_interval, Duration::from_secs(2));
        assert_eq!(config.client.default_deadline, Duration::from_secs(5));
        assert_eq!(config.client.backoff.initial_delay_ms, 50);
        assert_eq!(config.client.backoff.max_delay_ms, 5000);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
