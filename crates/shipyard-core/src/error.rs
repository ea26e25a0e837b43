//! Error types for Shipyard.

use thiserror::Error;

use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad job spec or step setup failure. Terminal, nothing is dispatched.
    #[error("preparation failed: {0}")]
    Preparation(String),

    /// Backend resource creation or connectivity failure.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    /// Output extraction, log persistence or step summarization failure.
    #[error("completion failed: {0}")]
    Completion(String),

    /// Only ever logged.
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Terminal job status this error maps to.
    pub fn job_status(&self) -> JobStatus {
        match self {
            Error::Timeout(_) => JobStatus::Timeout,
            Error::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
