//! Core orchestration logic.
//!
//! This module contains:
//! - JobRegistry / PolicyRegistry: named plugins
//! - PolicyEngine: concurrent policy evaluation
//! - PolicyConfigReader / EmergencyStop: reloaded file-backed configuration
//! - Executor: runs one request block by block
//! - Service: submit, execute and observe work with durable status

pub mod error;
pub mod estop;
pub mod executor;
pub mod jobs;
pub mod policy;
pub mod policy_config;
mod reload;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use error::{Code, ServiceError};
pub use estop::{EmergencyStop, StopConfigError, StopEntry, StopStatus, Subscription};
pub use executor::{EngineContext, Executor, ValidationError};
pub use jobs::{JobError, JobPlugin, JobRegistry, RegistryError};
pub use policy::{Policy, PolicyArg, PolicyEngine, PolicyError, PolicyRegistry, PolicySettings};
pub use policy_config::{PolicyConfig, PolicyConfigError, PolicyConfigRead, PolicyConfigReader};
pub use service::{RecentStatus, Service, ServiceConfig};
pub use store::{StoreError, WorkStore};
