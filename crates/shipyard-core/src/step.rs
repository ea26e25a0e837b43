//! Steps of a job and the step-execution collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::context::WorkflowRunContext;

/// One step executed by the remote executor, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTask {
    pub name: String,
    /// Step kind understood by the executor (`shell`, `git`, `archive`, ...).
    pub step_type: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl StepTask {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            spec,
        }
    }
}

/// Turns declared steps into runnable ones before dispatch and finalizes
/// step metadata after completion.
///
/// Both calls receive the job's search path so steps can register tool
/// directories on it.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn prepare(
        &self,
        run: &WorkflowRunContext,
        paths: &mut String,
        job_name: &str,
        steps: &mut [StepTask],
    ) -> Result<()>;

    async fn summarize(
        &self,
        run: &WorkflowRunContext,
        paths: &mut String,
        job_name: &str,
        steps: &mut [StepTask],
    ) -> Result<()>;
}
