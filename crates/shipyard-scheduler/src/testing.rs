//! Fakes for controller and pool tests.

use async_trait::async_trait;
use shipyard_core::cluster::{
    ClusterBackend, ClusterJobRequest, ClusterJobState, ClusterProvider, JobLabel, JobObserver,
    OutputValue,
};
use shipyard_core::job::{
    FreestyleJobSpec, Infrastructure, JobProperties, JobStatus, RegistryNamespace,
};
use shipyard_core::step::{StepRunner, StepTask};
use shipyard_core::{Error, JobTask, Result, WorkflowRunContext};
use shipyard_db::{MemoryJobInfoRepo, MemoryJobLogRepo, MemoryRemoteJobRepo};
use shipyard_executor::{DefaultImageResolver, DockerHosts, WaitSettings};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::controller::Ack;
use crate::services::{ControllerSettings, JobServices};

/// How a fake cluster job behaves once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Runs and reports `passed` with one `IMAGE` output.
    #[default]
    Pass,
    /// Runs and reports `failed`.
    Fail,
    /// Stays pending forever.
    NeverStart,
    /// Runs forever without reporting.
    Hang,
    /// Passes, but its outputs cannot be read.
    BadOutputs,
}

/// An in-memory cluster. Jobs and ConfigMaps are keyed by name.
#[derive(Default)]
pub struct FakeCluster {
    jobs: Mutex<HashSet<String>>,
    config_maps: Mutex<HashSet<String>>,
    behavior: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<ClusterJobRequest>>,
}

impl FakeCluster {
    pub fn set_behavior(&self, job: &str, behavior: Behavior) {
        self.behavior.lock().unwrap().insert(job.to_string(), behavior);
    }

    /// Leave objects behind as a crashed earlier attempt would.
    pub fn add_stale(&self, job: &str) {
        self.jobs.lock().unwrap().insert(job.to_string());
        self.config_maps.lock().unwrap().insert(job.to_string());
    }

    /// Make every later backend call named `op` (e.g. `create_job`) fail
    /// after it was recorded.
    pub fn fail_call(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn requests(&self) -> Vec<ClusterJobRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn exists(&self, job: &str) -> bool {
        self.jobs.lock().unwrap().contains(job) || self.config_maps.lock().unwrap().contains(job)
    }

    fn record(&self, op: &str, target: impl std::fmt::Display) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{}:{}", op, target));
        if self.failing.lock().unwrap().contains(op) {
            return Err(Error::Cluster(format!("{} rejected by api server", op)));
        }
        Ok(())
    }

    fn behavior_of(&self, job: &str) -> Behavior {
        self.behavior.lock().unwrap().get(job).copied().unwrap_or_default()
    }
}

impl JobObserver for FakeCluster {
    fn job_state(&self, _namespace: &str, name: &str) -> ClusterJobState {
        if !self.jobs.lock().unwrap().contains(name) {
            return ClusterJobState::Missing;
        }
        match self.behavior_of(name) {
            Behavior::NeverStart => ClusterJobState::Pending,
            _ => ClusterJobState::Running,
        }
    }

    fn sentinel(&self, _namespace: &str, config_map: &str) -> Option<JobStatus> {
        if !self.jobs.lock().unwrap().contains(config_map) {
            return None;
        }
        match self.behavior_of(config_map) {
            Behavior::Pass | Behavior::BadOutputs => Some(JobStatus::Passed),
            Behavior::Fail => Some(JobStatus::Failed),
            Behavior::NeverStart | Behavior::Hang => None,
        }
    }

    fn outputs(&self, _namespace: &str, config_map: &str) -> Result<Vec<OutputValue>> {
        if self.behavior_of(config_map) == Behavior::BadOutputs {
            return Err(Error::Completion("malformed outputs".to_string()));
        }
        Ok(vec![OutputValue {
            name: "IMAGE".to_string(),
            value: format!("registry/{}:1", config_map),
        }])
    }
}

/// Backend view of a [`FakeCluster`].
pub struct FakeBackend {
    cluster_id: String,
    state: Arc<FakeCluster>,
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn ensure_delete_config_maps(&self, _namespace: &str, label: &JobLabel) -> Result<()> {
        self.state.record("delete_config_maps", &label.job_name)?;
        self.state.config_maps.lock().unwrap().remove(&label.job_name);
        Ok(())
    }

    async fn create_context_config_map(
        &self,
        _namespace: &str,
        name: &str,
        _label: &JobLabel,
        _context: &str,
    ) -> Result<()> {
        self.state.record("create_config_map", name)?;
        if !self.state.config_maps.lock().unwrap().insert(name.to_string()) {
            return Err(Error::Cluster(format!("configmap {} already exists", name)));
        }
        Ok(())
    }

    async fn ensure_delete_jobs(&self, _namespace: &str, label: &JobLabel) -> Result<()> {
        self.state.record("delete_jobs", &label.job_name)?;
        self.state.jobs.lock().unwrap().remove(&label.job_name);
        Ok(())
    }

    async fn apply_registry_secrets(
        &self,
        _namespace: &str,
        registries: &[RegistryNamespace],
    ) -> Result<()> {
        self.state.record("apply_secrets", registries.len())?;
        Ok(())
    }

    async fn create_job(&self, request: &ClusterJobRequest) -> Result<()> {
        self.state.record("create_job", &request.name)?;
        if !self.state.jobs.lock().unwrap().insert(request.name.clone()) {
            return Err(Error::Cluster(format!("job {} already exists", request.name)));
        }
        self.state.requests.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn observe(&self, _namespace: &str) -> Result<Arc<dyn JobObserver>> {
        Ok(self.state.clone())
    }

    async fn collect_logs(&self, _namespace: &str, label: &JobLabel) -> Result<String> {
        self.state.record("collect_logs", &label.job_name)?;
        Ok(format!("logs of {}", label.job_name))
    }
}

pub struct FakeProvider {
    pub state: Arc<FakeCluster>,
    pub unreachable: HashSet<String>,
}

#[async_trait]
impl ClusterProvider for FakeProvider {
    async fn connect(&self, cluster_id: &str) -> Result<Arc<dyn ClusterBackend>> {
        if self.unreachable.contains(cluster_id) {
            return Err(Error::Cluster(format!("cluster {} is offline", cluster_id)));
        }
        Ok(Arc::new(FakeBackend {
            cluster_id: cluster_id.to_string(),
            state: self.state.clone(),
        }))
    }
}

/// Step runner that can be told to panic or fail for a job.
#[derive(Default)]
pub struct FakeSteps {
    pub panic_on: Option<String>,
    pub fail_summarize: bool,
    /// Jobs `summarize` was called for.
    pub summarized: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StepRunner for FakeSteps {
    async fn prepare(
        &self,
        _run: &WorkflowRunContext,
        _paths: &mut String,
        job_name: &str,
        _steps: &mut [StepTask],
    ) -> Result<()> {
        if self.panic_on.as_deref() == Some(job_name) {
            panic!("step runner exploded on {}", job_name);
        }
        Ok(())
    }

    async fn summarize(
        &self,
        _run: &WorkflowRunContext,
        _paths: &mut String,
        job_name: &str,
        _steps: &mut [StepTask],
    ) -> Result<()> {
        self.summarized.lock().unwrap().push(job_name.to_string());
        if self.fail_summarize {
            return Err(Error::Internal("summary store offline".to_string()));
        }
        Ok(())
    }
}

/// Services wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub remote_jobs: Arc<MemoryRemoteJobRepo>,
    pub job_infos: Arc<MemoryJobInfoRepo>,
    pub logs: Arc<MemoryJobLogRepo>,
    pub steps: FakeSteps,
    pub unreachable: HashSet<String>,
    pub cleanup: TaskTracker,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cluster: Arc::new(FakeCluster::default()),
            remote_jobs: Arc::new(MemoryRemoteJobRepo::new()),
            job_infos: Arc::new(MemoryJobInfoRepo::new()),
            logs: Arc::new(MemoryJobLogRepo::new()),
            steps: FakeSteps::default(),
            unreachable: HashSet::new(),
            cleanup: TaskTracker::new(),
        }
    }

    pub fn run(&self) -> Arc<WorkflowRunContext> {
        Arc::new(WorkflowRunContext {
            run_id: 7,
            workflow_name: "release".to_string(),
            workflow_display_name: "Release".to_string(),
            workspace: "/workspace".to_string(),
            project_name: "shop".to_string(),
        })
    }

    /// Builds services. Takes the step runner configuration out of the
    /// harness, so call this once per harness.
    pub fn services(&mut self) -> JobServices {
        JobServices {
            steps: Arc::new(std::mem::take(&mut self.steps)),
            remote_jobs: self.remote_jobs.clone(),
            job_infos: self.job_infos.clone(),
            logs: self.logs.clone(),
            clusters: Arc::new(FakeProvider {
                state: self.cluster.clone(),
                unreachable: self.unreachable.clone(),
            }),
            docker_hosts: Arc::new(DockerHosts::new(BTreeMap::from([(
                "local".to_string(),
                vec!["tcp://dind-0.dind:2375".to_string()],
            )]))),
            images: Arc::new(DefaultImageResolver::new("registry.example.com/shipyard")),
            settings: ControllerSettings {
                namespace: "shipyard".to_string(),
                agent_namespace: "shipyard-agent".to_string(),
                wait: WaitSettings {
                    poll_interval: Duration::from_millis(100),
                    sentinel_grace: Duration::from_secs(10),
                },
            },
            cleanup: self.cleanup.clone(),
        }
    }

    /// Wait for background cleanup to finish.
    pub async fn drain_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
    }
}

/// An acknowledgement callback recording every status it sees.
pub fn ack_log() -> (Ack, Arc<Mutex<Vec<JobStatus>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let ack: Ack = Arc::new(move |job: &JobTask| sink.lock().unwrap().push(job.status()));
    (ack, seen)
}

/// Acks per job name.
pub fn ack_by_job() -> (Ack, Arc<Mutex<Vec<(String, JobStatus)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let ack: Ack = Arc::new(move |job: &JobTask| {
        sink.lock().unwrap().push((job.name.clone(), job.status()))
    });
    (ack, seen)
}

/// Cluster resource name the controller derives for a job of the test run.
pub fn k8s_name(job: &str) -> String {
    JobTask::cluster_resource_name("release", 7, job)
}

pub fn freestyle_job(name: &str, infra: Infrastructure) -> JobTask {
    freestyle_job_with(name, infra, JobProperties::default())
}

pub fn freestyle_job_with(name: &str, infra: Infrastructure, properties: JobProperties) -> JobTask {
    let spec = FreestyleJobSpec {
        properties: JobProperties {
            build_os: "focal".to_string(),
            ..properties
        },
        steps: vec![StepTask::new("build", "shell", serde_json::json!({ "script": "make" }))],
    };
    JobTask::freestyle(name, infra, &spec).with_outputs(["IMAGE"])
}
