//! Job execution for Shipyard.
//!
//! Runs the jobs of a workflow run with bounded concurrency. Each job is
//! driven by a lifecycle controller picked by job type; controllers
//! dispatch to a Kubernetes cluster or a remote agent pool and follow the
//! job to a terminal status.

pub mod controller;
pub mod pool;
pub mod services;
pub mod steps;

#[cfg(test)]
mod testing;

pub use controller::{Ack, JobCtl, instantiate, run_job};
pub use pool::WorkerPool;
pub use services::{ControllerSettings, JobServices};
pub use steps::BasicStepRunner;
