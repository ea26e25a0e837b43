//! Workflow run metadata and the execution context handed to executors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::{CacheDirType, FreestyleJobSpec, Infrastructure, JobTask};
use crate::step::StepTask;
use crate::{Error, Result};

/// Per-run metadata shared read-only by every job of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowRunContext {
    /// Numeric task id of the run.
    pub run_id: u64,
    pub workflow_name: String,
    pub workflow_display_name: String,
    pub workspace: String,
    pub project_name: String,
}

/// Cache policy for remote agent jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub cache_enable: bool,
    pub cache_dir_type: CacheDirType,
    pub cache_user_dir: String,
}

/// Everything an executor needs to run a job's steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub name: String,
    /// `KEY=VALUE` entries.
    pub envs: Vec<String>,
    /// `KEY=VALUE` entries of credential variables, kept apart so executors
    /// can mask them.
    pub secret_envs: Vec<String>,
    pub workflow_name: String,
    pub workspace: String,
    pub task_id: u64,
    /// Names of the outputs the executor must capture.
    pub outputs: Vec<String>,
    pub steps: Vec<StepTask>,
    pub paths: String,
    pub config_map_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,
}

impl ExecutionContext {
    pub fn build(spec: &FreestyleJobSpec, job: &JobTask, run: &WorkflowRunContext) -> Self {
        let props = &spec.properties;
        let mut envs = Vec::new();
        let mut secret_envs = Vec::new();
        for env in &props.envs {
            let entry = format!("{}={}", env.key, env.value);
            if env.is_credential {
                secret_envs.push(entry);
            } else {
                envs.push(entry);
            }
        }
        if !props.docker_host.is_empty() {
            envs.push(format!("DOCKER_HOST={}", props.docker_host));
        }

        let cache = (job.infrastructure() == Infrastructure::Vm).then(|| CachePolicy {
            cache_enable: props.cache_enable,
            cache_dir_type: props.cache_dir_type,
            cache_user_dir: props.cache_user_dir.clone(),
        });

        Self {
            name: job.name.clone(),
            envs,
            secret_envs,
            workflow_name: run.workflow_name.clone(),
            workspace: run.workspace.clone(),
            task_id: run.run_id,
            outputs: job.output_names(),
            steps: spec.steps.clone(),
            paths: props.paths.clone(),
            config_map_name: job.k8s_job_name.clone(),
            cache,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("cannot serialize execution context: {}", e)))
    }

    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| Error::InvalidInput(format!("invalid execution context: {}", e)))
    }

    pub fn env_map(&self) -> BTreeMap<String, String> {
        split_entries(&self.envs)
    }

    pub fn secret_env_map(&self) -> BTreeMap<String, String> {
        split_entries(&self.secret_envs)
    }
}

fn split_entries(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|e| match e.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (e.clone(), String::new()),
        })
        .collect()
}
