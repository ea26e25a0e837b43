//! Core domain types and traits for the Shipyard job orchestrator.
//!
//! This crate contains:
//! - Job tasks, statuses and the freestyle job spec
//! - Workflow run metadata and the executor's execution context
//! - Collaborator traits for step execution, cluster backends and
//!   image/docker host resolution
//! - Record identifiers and the error taxonomy

pub mod cluster;
pub mod context;
pub mod error;
pub mod id;
pub mod infra;
pub mod job;
pub mod step;

pub use context::{ExecutionContext, WorkflowRunContext};
pub use error::{Error, Result};
pub use id::RecordId;
pub use job::{Infrastructure, JobStatus, JobTask, JobType};
