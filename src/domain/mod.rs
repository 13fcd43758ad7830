//! Domain types for the blockflow orchestrator.
//!
//! This module contains the core data structures:
//! - Request: what a client submits (workflow, blocks, jobs)
//! - Status: the execution state tree mirroring a request

pub mod request;
pub mod status;

// Re-export commonly used types
pub use request::{Block, Job, WorkRequest};
pub use status::{BlockStatus, JobStatus, Status, WorkStatus};
