//! Job tasks and the freestyle job spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::step::StepTask;
use crate::{Error, Result};

/// Cluster id meaning "the cluster Shipyard itself runs in".
pub const LOCAL_CLUSTER_ID: &str = "local";

/// Applied when a job declares no (or a non-positive) timeout. Minutes.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 600;

/// Longer timeouts are cut down to this. Thirty days, in minutes.
pub const MAX_TIMEOUT_MINUTES: i64 = 30 * 24 * 60;

/// Kubernetes object names are limited to 63 characters.
const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Status of a job. Variants are declared in rank order; a job's status only
/// ever moves to an equal or higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Created,
    Running,
    Passed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Passed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Passed => "passed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "passed" => Ok(JobStatus::Passed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// Backend a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Infrastructure {
    /// A Kubernetes cluster (local or attached).
    #[default]
    Kubernetes,
    /// A remote VM agent pool.
    Vm,
}

impl Infrastructure {
    pub fn as_str(self) -> &'static str {
        match self {
            Infrastructure::Kubernetes => "kubernetes",
            Infrastructure::Vm => "vm",
        }
    }
}

/// Declared job type. Build, test and scanning jobs are freestyle jobs with
/// a different origin; deploy jobs have no controller yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[default]
    Freestyle,
    Build,
    Test,
    Scanning,
    Deploy,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Freestyle => "freestyle",
            JobType::Build => "build",
            JobType::Test => "test",
            JobType::Scanning => "scanning",
            JobType::Deploy => "deploy",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource tier requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceRequest {
    /// The lowest tier, used when nothing is requested.
    Min,
    Low,
    Medium,
    High,
    /// Custom limits from [`JobProperties::res_req_spec`].
    Define,
}

impl ResourceRequest {
    /// Resource limits for this tier. `Define` falls back to `Min` limits
    /// when no custom spec is given.
    pub fn limits(self, custom: Option<&ResourceSpec>) -> ResourceSpec {
        match self {
            ResourceRequest::Min => ResourceSpec::new(2000, 2048),
            ResourceRequest::Low => ResourceSpec::new(4000, 8192),
            ResourceRequest::Medium => ResourceSpec::new(8000, 16384),
            ResourceRequest::High => ResourceSpec::new(16000, 32768),
            ResourceRequest::Define => custom
                .cloned()
                .unwrap_or_else(|| ResourceRequest::Min.limits(None)),
        }
    }
}

/// CPU (millicores) and memory (MiB) limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_limit_millis: u32,
    pub memory_limit_mib: u32,
}

impl ResourceSpec {
    pub fn new(cpu_limit_millis: u32, memory_limit_mib: u32) -> Self {
        Self {
            cpu_limit_millis,
            memory_limit_mib,
        }
    }
}

/// An environment variable declared on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// Credential values go to the secret env list of the execution context.
    #[serde(default)]
    pub is_credential: bool,
}

impl KeyVal {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_credential: false,
        }
    }

    pub fn credential(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            is_credential: true,
            ..Self::new(key, value)
        }
    }
}

/// A container registry (and optional namespace within it) with credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryNamespace {
    pub reg_addr: String,
    pub namespace: String,
    pub access_key: String,
    pub secret_key: String,
}

impl RegistryNamespace {
    /// Registry address without scheme, joined with the namespace if any.
    /// Images from this registry start with this prefix.
    pub fn image_prefix(&self) -> String {
        let addr = self
            .reg_addr
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        if self.namespace.is_empty() {
            addr.to_string()
        } else {
            format!("{}/{}", addr, self.namespace)
        }
    }
}

/// Where the cache directory of a VM job lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDirType {
    #[default]
    Workspace,
    UserDefined,
}

/// Resource and environment properties of a freestyle job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobProperties {
    /// Minutes. Non-positive means "use the default".
    pub timeout: i64,
    pub resource_request: Option<ResourceRequest>,
    pub res_req_spec: Option<ResourceSpec>,
    pub cluster_id: String,
    pub namespace: String,
    pub build_os: String,
    pub image_from: String,
    pub registries: Vec<RegistryNamespace>,
    pub docker_host: String,
    pub envs: Vec<KeyVal>,
    pub cache_enable: bool,
    pub cache_dir_type: CacheDirType,
    pub cache_user_dir: String,
    /// `PATH`-style search path used by step execution.
    pub paths: String,
}

/// Payload of freestyle-shaped jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreestyleJobSpec {
    pub properties: JobProperties,
    pub steps: Vec<StepTask>,
}

/// A declared job output and, once the job completed, its captured value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// One executable unit of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub name: String,
    /// Namespace under which outputs are published to later jobs.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    infrastructure: Infrastructure,
    #[serde(default)]
    status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Type-specific payload, decoded by the job's controller.
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub outputs: Vec<JobOutput>,
    #[serde(default)]
    pub resource_request: Option<ResourceRequest>,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub namespace: String,
    /// Name of the cluster-side Job and ConfigMap.
    #[serde(default)]
    pub k8s_job_name: String,
    /// Labels a remote agent must carry to pick up this job.
    #[serde(default)]
    pub vm_labels: Vec<String>,
    /// Name of the workflow job this task was expanded from.
    #[serde(default)]
    pub origin_name: String,
}

impl JobTask {
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        infrastructure: Infrastructure,
        spec: serde_json::Value,
    ) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            origin_name: name.clone(),
            name,
            job_type,
            infrastructure,
            status: JobStatus::Created,
            error: None,
            start_time: None,
            end_time: None,
            spec,
            outputs: Vec::new(),
            resource_request: None,
            cluster_id: String::new(),
            namespace: String::new(),
            k8s_job_name: String::new(),
            vm_labels: Vec::new(),
        }
    }

    /// A freestyle-shaped job with a typed spec.
    pub fn freestyle(
        name: impl Into<String>,
        infrastructure: Infrastructure,
        spec: &FreestyleJobSpec,
    ) -> Self {
        // FreestyleJobSpec only contains plain data, serializing cannot fail.
        let value = serde_json::to_value(spec).unwrap_or_default();
        Self::new(name, JobType::Freestyle, infrastructure, value)
    }

    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names
            .into_iter()
            .map(|n| JobOutput {
                name: n.into(),
                value: None,
            })
            .collect();
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn infrastructure(&self) -> Infrastructure {
        self.infrastructure
    }

    /// Move to `status` unless that would lower the current rank.
    /// Returns whether the status changed.
    pub fn advance_status(&mut self, status: JobStatus) -> bool {
        if status <= self.status {
            return false;
        }
        self.status = status;
        true
    }

    /// Record a failure: raise the status to `status` (ranks permitting) and
    /// keep the first error message.
    pub fn record_error(&mut self, status: JobStatus, message: impl Into<String>) {
        self.advance_status(status);
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }

    /// Store a captured value for a declared output. Undeclared names are
    /// ignored and reported as `false`.
    pub fn set_output(&mut self, name: &str, value: impl Into<String>) -> bool {
        match self.outputs.iter_mut().find(|o| o.name == name) {
            Some(output) => {
                output.value = Some(value.into());
                true
            }
            None => false,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            _ => 0,
        }
    }

    /// DNS-1123 name for the cluster resources of `job` in a run.
    pub fn cluster_resource_name(workflow: &str, run_id: u64, job: &str) -> String {
        let raw = format!("{}-{}-{}", workflow, run_id, job);
        let mut name: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        while name.contains("--") {
            name = name.replace("--", "-");
        }
        let name = name.trim_matches('-');

        if name.len() <= MAX_RESOURCE_NAME_LEN {
            return name.to_string();
        }

        // Keep names unique after truncation.
        let suffix = format!("{:08x}", fnv1a(raw.as_bytes()) as u32);
        let keep = MAX_RESOURCE_NAME_LEN - suffix.len() - 1;
        format!("{}-{}", name[..keep].trim_end_matches('-'), suffix)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}
