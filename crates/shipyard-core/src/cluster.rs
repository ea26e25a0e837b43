//! Cluster backend abstraction.
//!
//! Jobs targeting Kubernetes are run through three seams:
//! - [`ClusterProvider`] resolves a cluster id to a backend
//! - [`ClusterBackend`] creates and deletes the job's cluster resources
//! - [`JobObserver`] answers state questions from a watch cache

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;
use crate::job::{JobStatus, RegistryNamespace, ResourceSpec};

pub const LABEL_JOB_TYPE: &str = "s-job-type";
pub const LABEL_JOB_NAME: &str = "s-job-name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "shipyard";

/// ConfigMap key holding the serialized execution context.
pub const CONTEXT_KEY: &str = "job-context";
/// ConfigMap key the executor writes the job result to once it is done.
pub const SENTINEL_KEY: &str = "job-status";
/// ConfigMap key holding captured outputs as a JSON list of [`OutputValue`].
pub const OUTPUTS_KEY: &str = "job-outputs";

/// Label pair identifying every cluster object of one job. Cleanup matches
/// on it, so objects are found again even after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobLabel {
    pub job_type: String,
    pub job_name: String,
}

impl JobLabel {
    pub fn new(job_type: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            job_name: job_name.into(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_JOB_TYPE.to_string(), self.job_type.clone()),
            (LABEL_JOB_NAME.to_string(), self.job_name.clone()),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        ])
    }

    /// Label selector in Kubernetes list syntax.
    pub fn selector(&self) -> String {
        format!(
            "{}={},{}={}",
            LABEL_JOB_TYPE, self.job_type, LABEL_JOB_NAME, self.job_name
        )
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(LABEL_JOB_TYPE) == Some(&self.job_type)
            && labels.get(LABEL_JOB_NAME) == Some(&self.job_name)
    }
}

/// Everything needed to create the cluster job resource.
#[derive(Debug, Clone)]
pub struct ClusterJobRequest {
    pub name: String,
    pub namespace: String,
    pub cluster_id: String,
    pub image: String,
    pub label: JobLabel,
    pub resources: ResourceSpec,
    /// Registries whose pull secrets the pod references.
    pub registries: Vec<RegistryNamespace>,
    pub docker_host: String,
}

/// A captured output as written by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValue {
    pub name: String,
    pub value: String,
}

/// Lifecycle state of a cluster job resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterJobState {
    /// Not in the cache: never created, or already deleted.
    Missing,
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
}

impl ClusterJobState {
    /// Compute has started at some point.
    pub fn has_started(&self) -> bool {
        !matches!(self, ClusterJobState::Missing | ClusterJobState::Pending)
    }

    /// Compute for the job is gone or finished.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ClusterJobState::Missing | ClusterJobState::Succeeded | ClusterJobState::Failed { .. }
        )
    }
}

#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// API access for a cluster id.
    async fn connect(&self, cluster_id: &str) -> Result<Arc<dyn ClusterBackend>>;
}

/// Creates and deletes the cluster objects of jobs in one cluster.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn cluster_id(&self) -> &str;

    /// Delete ConfigMaps carrying `label` and wait until they are gone.
    /// Nothing to delete is not an error.
    async fn ensure_delete_config_maps(&self, namespace: &str, label: &JobLabel) -> Result<()>;

    async fn create_context_config_map(
        &self,
        namespace: &str,
        name: &str,
        label: &JobLabel,
        context: &str,
    ) -> Result<()>;

    /// Delete Jobs (and their pods) carrying `label` and wait until they are
    /// gone.
    async fn ensure_delete_jobs(&self, namespace: &str, label: &JobLabel) -> Result<()>;

    /// Create or update image pull secrets for `registries`.
    async fn apply_registry_secrets(
        &self,
        namespace: &str,
        registries: &[RegistryNamespace],
    ) -> Result<()>;

    async fn create_job(&self, request: &ClusterJobRequest) -> Result<()>;

    /// Cached watch over Jobs, Pods and ConfigMaps of `namespace`.
    async fn observe(&self, namespace: &str) -> Result<Arc<dyn JobObserver>>;

    /// Log output of the pods carrying `label`.
    async fn collect_logs(&self, namespace: &str, label: &JobLabel) -> Result<String>;
}

/// Read-only view over a watch cache. Calls never hit the API server.
pub trait JobObserver: Send + Sync {
    fn job_state(&self, namespace: &str, name: &str) -> ClusterJobState;

    /// Result the executor reported in the context ConfigMap, if any.
    fn sentinel(&self, namespace: &str, config_map: &str) -> Option<JobStatus>;

    /// Outputs from the context ConfigMap. `NotFound` when the ConfigMap is
    /// not in the cache.
    fn outputs(&self, namespace: &str, config_map: &str) -> Result<Vec<OutputValue>>;
}
