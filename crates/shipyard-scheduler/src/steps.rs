//! Step runner used when no richer step tooling is plugged in.

use async_trait::async_trait;
use shipyard_core::step::{StepRunner, StepTask};
use shipyard_core::{Error, Result, WorkflowRunContext};
use std::collections::HashSet;
use tracing::debug;

/// Checks declared steps and puts the workspace `bin` directory on the
/// job's search path.
#[derive(Debug, Default, Clone)]
pub struct BasicStepRunner;

impl BasicStepRunner {
    pub fn new() -> Self {
        Self
    }
}

fn extend_paths(paths: &mut String, dir: &str) {
    if paths.split(':').any(|p| p == dir) {
        return;
    }
    if !paths.is_empty() {
        paths.push(':');
    }
    paths.push_str(dir);
}

#[async_trait]
impl StepRunner for BasicStepRunner {
    async fn prepare(
        &self,
        run: &WorkflowRunContext,
        paths: &mut String,
        job_name: &str,
        steps: &mut [StepTask],
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for step in steps.iter() {
            if step.name.is_empty() {
                return Err(Error::InvalidInput(format!("job {} has a step without a name", job_name)));
            }
            if step.step_type.is_empty() {
                return Err(Error::InvalidInput(format!("step {} of job {} has no type", step.name, job_name)));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(Error::InvalidInput(format!("duplicate step {} in job {}", step.name, job_name)));
            }
        }

        if !run.workspace.is_empty() {
            extend_paths(paths, &format!("{}/bin", run.workspace.trim_end_matches('/')));
        }
        debug!(job = job_name, steps = steps.len(), "Prepared steps");
        Ok(())
    }

    /// Steps here carry no tooling of their own that would produce
    /// reports, so there is nothing to collect after a run beyond logging.
    async fn summarize(
        &self,
        _run: &WorkflowRunContext,
        _paths: &mut String,
        job_name: &str,
        steps: &mut [StepTask],
    ) -> Result<()> {
        debug!(job = job_name, steps = steps.len(), "Summarized steps");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> WorkflowRunContext {
        WorkflowRunContext {
            workspace: "/workspace/".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_prepare_extends_paths_once() {
        let runner = BasicStepRunner::new();
        let mut paths = "/usr/bin".to_string();
        let mut steps = vec![StepTask::new("build", "shell", serde_json::Value::Null)];

        runner.prepare(&run(), &mut paths, "build", &mut steps).await.unwrap();
        runner.prepare(&run(), &mut paths, "build", &mut steps).await.unwrap();

        assert_eq!(paths, "/usr/bin:/workspace/bin");
    }

    #[tokio::test]
    async fn test_prepare_rejects_duplicate_steps() {
        let runner = BasicStepRunner::new();
        let mut paths = String::new();
        let mut steps = vec![
            StepTask::new("build", "shell", serde_json::Value::Null),
            StepTask::new("build", "archive", serde_json::Value::Null),
        ];

        let result = runner.prepare(&run(), &mut paths, "build", &mut steps).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
