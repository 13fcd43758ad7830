//! blockflow - block-sequenced job orchestrator
//!
//! Clients submit a work request: an ordered list of blocks, each holding
//! jobs that run concurrently under the block's rate limit. Requests are
//! checked against the policies bound to their workflow, stored durably,
//! executed at most once and observed through live or persisted status.
//!
//! # Architecture
//!
//! - Jobs and policies are plugins registered by name at startup
//! - Policy bindings and the emergency-stop table are files reloaded on an
//!   interval; readers always see a complete snapshot
//! - Every run can be cancelled cooperatively, by a fatal job error within
//!   a block or by the workflow's emergency stop
//!
//! # Modules
//!
//! - `client`: Resilient client (deadline, backoff, circuit breaker)
//! - `core`: Registries, policy engine, executor, storage and service
//! - `domain`: Work requests and status trees
//! - `plugins`: Built-in jobs and policies
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit and execute a request, following it to completion
//! blockflow run request.yaml
//!
//! # Check status
//! blockflow status <work-id>
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod domain;
pub mod plugins;

// Re-export main types at crate root for convenience
pub use client::{ClientError, ResilientClient, Transport};
pub use core::{Code, Executor, Service, ServiceConfig, ServiceError};
pub use domain::{Block, Job, Status, WorkRequest, WorkStatus};
