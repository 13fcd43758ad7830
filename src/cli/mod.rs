//! Command-line interface for blockflow.
//!
//! Provides commands for submitting and executing work requests, checking
//! status and listing recent work. Every command talks to an in-process
//! service through the resilient client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::client::ResilientClient;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    EmergencyStop, EngineContext, JobRegistry, PolicyConfigReader, PolicyEngine, PolicyRegistry,
    RecentStatus, Service, WorkStore,
};
use crate::domain::{Status, WorkRequest, WorkStatus};
use crate::plugins;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// blockflow - block-sequenced job orchestrator
#[derive(Parser, Debug)]
#[command(name = "blockflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate and store a work request, printing its ID
    Submit {
        /// Work request document (YAML or JSON)
        request: PathBuf,
    },

    /// Execute submitted work and follow it to completion
    Exec {
        /// Work ID returned by submit
        id: String,
    },

    /// Submit and execute in one step
    Run {
        /// Work request document (YAML or JSON)
        request: PathBuf,
    },

    /// Show the status of a work request
    Status {
        /// Work ID
        id: String,
    },

    /// List recent work
    Runs {
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Submit { request } => {
                let engine = Engine::start(cfg).await?;
                let id = submit(&engine, &request).await?;
                println!("{id}");
                Ok(())
            }
            Commands::Exec { id } => {
                let engine = Engine::start(cfg).await?;
                exec_and_follow(&engine, parse_id(&id)?).await
            }
            Commands::Run { request } => {
                let engine = Engine::start(cfg).await?;
                let id = submit(&engine, &request).await?;
                eprintln!("[Submitted {id}]");
                exec_and_follow(&engine, id).await
            }
            Commands::Status { id } => {
                let engine = Engine::start(cfg).await?;
                let status = engine.client.status(parse_id(&id)?, None).await?;
                print_status(&status);
                Ok(())
            }
            Commands::Runs { limit } => {
                let engine = Engine::start(cfg).await?;
                list_runs(&engine, limit).await
            }
            Commands::Config => {
                show_config(cfg);
                Ok(())
            }
        }
    }
}

/// In-process service plus the client used to reach it
struct Engine {
    service: Arc<Service>,
    client: ResilientClient,
}

impl Engine {
    async fn start(cfg: &ResolvedConfig) -> Result<Self> {
        let mut jobs = JobRegistry::new();
        let mut policies = PolicyRegistry::new();
        plugins::register_builtin(&mut jobs, &mut policies);
        let jobs = Arc::new(jobs);
        let policies = Arc::new(policies);

        let policy_config =
            PolicyConfigReader::load(&cfg.policy_file, Arc::clone(&policies), Arc::clone(&jobs))
                .await
                .with_context(|| {
                    format!("Failed to load policy config: {}", cfg.policy_file.display())
                })?;
        policy_config.start_reloading(cfg.reload_interval);

        let estop = EmergencyStop::load(&cfg.estop_file)
            .await
            .with_context(|| {
                format!("Failed to load emergency stop table: {}", cfg.estop_file.display())
            })?;
        estop.start_reloading(cfg.reload_interval);

        let store = WorkStore::open(&cfg.storage_dir).await.with_context(|| {
            format!("Storage directory is not usable: {}", cfg.storage_dir.display())
        })?;

        let ctx = EngineContext {
            jobs,
            policies: PolicyEngine::new(policies),
            policy_config: Arc::new(policy_config),
            estop: Arc::new(estop),
        };
        let service = Arc::new(Service::new(ctx, store, cfg.service.clone()));
        let client = ResilientClient::with_options(service.clone(), cfg.client.clone());

        Ok(Self { service, client })
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid work ID: {id}"))
}

fn load_request(path: &Path) -> Result<WorkRequest> {
    WorkRequest::from_file(path)
        .with_context(|| format!("Failed to load work request: {}", path.display()))
}

async fn submit(engine: &Engine, path: &Path) -> Result<Uuid> {
    let request = load_request(path)?;
    Ok(engine.client.submit(&request, None).await?)
}

/// Start the run and poll until it finishes
async fn exec_and_follow(engine: &Engine, id: Uuid) -> Result<()> {
    engine.client.exec(id, None).await?;

    let mut last = Status::NotStarted;
    let status = loop {
        let status = engine.client.status(id, None).await?;
        if status.status != last {
            eprintln!("[{id}: {}]", status.status);
            last = status.status;
        }
        if status.is_finished() {
            break status;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    print_status(&status);

    if status.status == Status::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_status(status: &WorkStatus) {
    println!("Workflow: {}", status.name);
    if !status.desc.is_empty() {
        println!("Description: {}", status.desc);
    }
    println!("Status: {}", status.status);
    if let Some(started) = status.started_at {
        println!("Started: {started}");
    }
    if let Some(finished) = status.finished_at {
        println!("Finished: {finished}");
    }
    if status.was_emergency_stopped {
        println!("Emergency stopped: yes");
    }
    if let Some(error) = &status.error {
        println!("Error: {error}");
    }

    for (i, block) in status.blocks.iter().enumerate() {
        println!("\nBlock {i} [{}] {}", block.status, block.desc);
        for job in &block.jobs {
            match &job.error {
                Some(error) => println!("  {:<20} {:<12} {}", job.name, job.status, error),
                None => println!("  {:<20} {}", job.name, job.status),
            }
        }
    }
}

async fn list_runs(engine: &Engine, limit: usize) -> Result<()> {
    let recent = engine.service.recent(limit).await?;

    if recent.is_empty() {
        println!("No work found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<15}", "WORK ID", "WORKFLOW", "STATUS");
    println!("{}", "-".repeat(75));

    for (id, status) in recent {
        match status {
            RecentStatus::Known(status) => {
                println!("{:<38} {:<20} {:<15}", id, status.name, status.status)
            }
            RecentStatus::Submitted => println!("{:<38} {:<20} {:<15}", id, "-", "submitted"),
            RecentStatus::Unreadable(_) => {
                println!("{:<38} {:<20} {:<15}", id, "-", "unreadable")
            }
        }
    }

    Ok(())
}

fn show_config(cfg: &ResolvedConfig) {
    let config_file = cfg
        .config_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none - using defaults)".to_string());

    println!("blockflow configuration");
    println!();
    println!("Config file: {config_file}");
    println!();
    println!("Paths:");
    println!("  Home:           {}", cfg.home.display());
    println!("  Storage:        {}", cfg.storage_dir.display());
    println!("  Policies:       {}", cfg.policy_file.display());
    println!("  Emergency stop: {}", cfg.estop_file.display());
    println!();
    println!("Service:");
    println!("  Max in flight:  {}", cfg.service.max_in_flight);
    println!("  Exec window:    {}s", cfg.service.exec_window.as_secs());
    println!("  Reload every:   {}s", cfg.reload_interval.as_secs());
    println!();
    println!("Client:");
    println!("  Deadline:       {}s", cfg.client.default_deadline.as_secs());
    println!(
        "  Backoff:        {}ms x{} up to {}ms",
        cfg.client.backoff.initial_delay_ms,
        cfg.client.backoff.multiplier,
        cfg.client.backoff.max_delay_ms
    );
    println!(
        "  Breaker:        {} failures, {}s cool-down",
        cfg.client.breaker.failure_threshold,
        cfg.client.breaker.cool_down.as_secs()
    );
}
