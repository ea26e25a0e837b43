//! Controller for freestyle-shaped jobs (freestyle, build, test, scanning).

use async_trait::async_trait;
use shipyard_config::placeholders::blank_unresolved;
use shipyard_core::cluster::{ClusterBackend, ClusterJobRequest, JobLabel, JobObserver};
use shipyard_core::job::{
    DEFAULT_TIMEOUT_MINUTES, FreestyleJobSpec, Infrastructure, JobStatus, LOCAL_CLUSTER_ID,
    MAX_TIMEOUT_MINUTES, ResourceRequest,
};
use shipyard_core::{Error, ExecutionContext, JobTask, RecordId, Result, WorkflowRunContext};
use shipyard_db::{DbResult, JobInfoRepo, RemoteJobRecord};
use shipyard_executor::route_docker_host;
use shipyard_executor::watch::{wait_job_end, wait_job_start, wait_remote_end, wait_remote_start};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Ack, JobCtl, save_job_info};
use crate::services::JobServices;

pub struct FreestyleJobCtl {
    job: JobTask,
    spec: FreestyleJobSpec,
    run: Arc<WorkflowRunContext>,
    services: JobServices,
    ack: Ack,
}

impl FreestyleJobCtl {
    pub fn new(job: JobTask, run: Arc<WorkflowRunContext>, services: JobServices, ack: Ack) -> Self {
        Self {
            job,
            spec: FreestyleJobSpec::default(),
            run,
            services,
            ack,
        }
    }

    fn fail(&mut self, error: Error) {
        warn!(job = %self.job.name, error = %error, "Job failed");
        self.job.record_error(error.job_status(), error.to_string());
    }

    fn acknowledge(&self) {
        (self.ack)(&self.job);
    }

    fn is_local(&self) -> bool {
        self.job.cluster_id == LOCAL_CLUSTER_ID
    }

    fn timeout(&self) -> Duration {
        let minutes = self.spec.properties.timeout.clamp(1, MAX_TIMEOUT_MINUTES) as u64;
        Duration::from_secs(minutes.saturating_mul(60))
    }

    fn label(&self) -> JobLabel {
        JobLabel::new(self.job.job_type.as_str(), self.job.k8s_job_name.clone())
    }

    /// Decode the payload and fill in defaults. Nothing outside the job is
    /// touched until this succeeded.
    async fn prepare(&mut self) -> Result<()> {
        let mut spec: FreestyleJobSpec = serde_json::from_value(self.job.spec.clone())
            .map_err(|e| Error::Preparation(format!("invalid freestyle spec: {}", e)))?;
        let props = &mut spec.properties;

        let blanked = blank_unresolved(&mut props.envs);
        if !blanked.is_empty() {
            debug!(job = %self.job.name, keys = ?blanked, "Blanked unresolved placeholders");
        }
        if props.timeout <= 0 {
            props.timeout = DEFAULT_TIMEOUT_MINUTES;
        } else if props.timeout > MAX_TIMEOUT_MINUTES {
            warn!(job = %self.job.name, timeout = props.timeout, "Timeout too long, capping");
            props.timeout = MAX_TIMEOUT_MINUTES;
        }

        let tier = self
            .job
            .resource_request
            .or(props.resource_request)
            .unwrap_or(ResourceRequest::Min);
        self.job.resource_request = Some(tier);
        props.resource_request = Some(tier);

        if props.cluster_id.is_empty() {
            props.cluster_id = if self.job.cluster_id.is_empty() {
                LOCAL_CLUSTER_ID.to_string()
            } else {
                self.job.cluster_id.clone()
            };
        }
        self.job.cluster_id = props.cluster_id.clone();

        if self.job.k8s_job_name.is_empty() {
            self.job.k8s_job_name = JobTask::cluster_resource_name(
                &self.run.workflow_name,
                self.run.run_id,
                &self.job.name,
            );
        }

        self.services
            .steps
            .prepare(&self.run, &mut props.paths, &self.job.name, &mut spec.steps)
            .await
            .map_err(|e| Error::Preparation(e.to_string()))?;

        self.job.spec = serde_json::to_value(&spec)
            .map_err(|e| Error::Preparation(format!("cannot encode freestyle spec: {}", e)))?;
        self.spec = spec;
        Ok(())
    }

    fn context_json(&self) -> Result<String> {
        ExecutionContext::build(&self.spec, &self.job, &self.run)
            .to_json()
            .map_err(|e| Error::Dispatch(e.to_string()))
    }

    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout())
            .unwrap_or_else(|| now + Duration::from_secs(DEFAULT_TIMEOUT_MINUTES as u64 * 60))
    }

    // Cluster path

    async fn run_cluster(&mut self, cancel: &CancellationToken) {
        let backend = match self.services.clusters.connect(&self.job.cluster_id).await {
            Ok(backend) => backend,
            Err(e) => {
                self.fail(Error::Dispatch(format!(
                    "cannot connect to cluster {}: {}",
                    self.job.cluster_id, e
                )));
                return;
            }
        };

        match self.dispatch_cluster(backend.as_ref()).await {
            Ok(observer) => {
                if let Err(e) = self.wait_cluster(observer.as_ref(), cancel).await {
                    self.fail(e);
                }
                self.complete_cluster(backend.as_ref(), observer.as_ref()).await;
            }
            Err(e) => self.fail(e),
        }

        self.spawn_cluster_cleanup(backend);
    }

    async fn dispatch_cluster(&mut self, backend: &dyn ClusterBackend) -> Result<Arc<dyn JobObserver>> {
        let settings = &self.services.settings;
        let namespace = if self.is_local() {
            settings.namespace.clone()
        } else {
            settings.agent_namespace.clone()
        };
        self.job.namespace = namespace.clone();
        self.spec.properties.namespace = namespace.clone();

        let host = self
            .services
            .docker_hosts
            .best_host(&self.job.cluster_id, &self.run.run_id.to_string());
        self.spec.properties.docker_host = route_docker_host(
            &host,
            &self.job.cluster_id,
            &settings.namespace,
            &settings.agent_namespace,
        );

        let context = self.context_json()?;
        let label = self.label();
        let name = self.job.k8s_job_name.clone();
        let dispatch = |what: &str, e: Error| Error::Dispatch(format!("{} {}: {}", what, name, e));

        backend
            .ensure_delete_config_maps(&namespace, &label)
            .await
            .map_err(|e| dispatch("cannot clean up configmaps of", e))?;
        backend
            .create_context_config_map(&namespace, &name, &label, &context)
            .await
            .map_err(|e| dispatch("cannot create configmap", e))?;

        let props = &self.spec.properties;
        let image = self.services.images.base_image(&props.build_os, &props.image_from);
        let registries = self.services.images.matched_registries(&image, &props.registries);

        backend
            .ensure_delete_jobs(&namespace, &label)
            .await
            .map_err(|e| dispatch("cannot clean up jobs of", e))?;
        backend
            .apply_registry_secrets(&namespace, &registries)
            .await
            .map_err(|e| dispatch("cannot create registry secrets for", e))?;

        let tier = self.job.resource_request.unwrap_or(ResourceRequest::Min);
        let request = ClusterJobRequest {
            name: name.clone(),
            namespace: namespace.clone(),
            cluster_id: self.job.cluster_id.clone(),
            image,
            label,
            resources: tier.limits(props.res_req_spec.as_ref()),
            registries,
            docker_host: props.docker_host.clone(),
        };
        backend
            .create_job(&request)
            .await
            .map_err(|e| dispatch("cannot create job", e))?;

        let observer = backend
            .observe(&namespace)
            .await
            .map_err(|e| dispatch("cannot watch", e))?;
        info!(job = %self.job.name, cluster = %self.job.cluster_id, namespace = %namespace, "Dispatched cluster job");
        Ok(observer)
    }

    async fn wait_cluster(&mut self, observer: &dyn JobObserver, cancel: &CancellationToken) -> Result<()> {
        let deadline = self.deadline();
        let settings = self.services.settings.wait;
        let namespace = self.job.namespace.clone();
        let name = self.job.k8s_job_name.clone();

        wait_job_start(observer, &namespace, &name, deadline, settings, cancel).await?;
        self.job.advance_status(JobStatus::Running);
        self.acknowledge();

        let status = wait_job_end(observer, &namespace, &name, &name, deadline, settings, cancel).await?;
        self.finish_with(status);
        Ok(())
    }

    async fn complete_cluster(&mut self, backend: &dyn ClusterBackend, observer: &dyn JobObserver) {
        let namespace = self.job.namespace.clone();
        let name = self.job.k8s_job_name.clone();

        match observer.outputs(&namespace, &name) {
            Ok(outputs) => {
                for output in outputs {
                    self.job.set_output(&output.name, output.value);
                }
            }
            Err(e) if !self.job.outputs.is_empty() => {
                self.fail(Error::Completion(format!("cannot read outputs: {}", e)));
            }
            Err(e) => debug!(job = %self.job.name, error = %e, "No outputs to read"),
        }

        let saved = match backend.collect_logs(&namespace, &self.label()).await {
            Ok(logs) => self
                .services
                .logs
                .save_log(&self.run.workflow_name, self.run.run_id, &self.job.name, &logs)
                .await
                .map_err(|e| Error::Completion(format!("cannot save logs: {}", e))),
            Err(e) => Err(Error::Completion(format!("cannot collect logs: {}", e))),
        };
        if let Err(e) = saved {
            self.fail(e);
        }

        self.summarize().await;
    }

    fn spawn_cluster_cleanup(&self, backend: Arc<dyn ClusterBackend>) {
        let namespace = self.job.namespace.clone();
        let label = self.label();
        self.services.cleanup.spawn(async move {
            if let Err(e) = backend.ensure_delete_jobs(&namespace, &label).await {
                warn!(job = %label.job_name, error = %e, "Failed to delete cluster job");
            }
            if let Err(e) = backend.ensure_delete_config_maps(&namespace, &label).await {
                warn!(job = %label.job_name, error = %e, "Failed to delete context configmap");
            }
            debug!(job = %label.job_name, "Cleaned up cluster resources");
        });
    }

    // Remote agent path

    async fn run_remote(&mut self, cancel: &CancellationToken) {
        let id = match self.dispatch_remote().await {
            Ok(id) => id,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        match self.wait_remote(id, cancel).await {
            Ok(record) => self.finish_with(record.status),
            Err(e) => self.fail(e),
        }
        self.complete_remote(id).await;

        let repo = self.services.remote_jobs.clone();
        self.services.cleanup.spawn(async move {
            if let Err(e) = repo.delete_by_id(id).await {
                warn!(record = %id, error = %e, "Failed to delete remote job record");
            }
        });
    }

    async fn dispatch_remote(&mut self) -> Result<RecordId> {
        let context = self.context_json()?;
        let mut record = RemoteJobRecord::new(
            self.run.project_name.clone(),
            self.run.workflow_name.clone(),
            self.run.run_id,
            self.job.name.clone(),
            self.job.job_type.as_str(),
            context,
        );
        record.origin_job_name = self.job.origin_name.clone();
        record.labels = self.job.vm_labels.clone();

        self.services
            .remote_jobs
            .create(&record)
            .await
            .map_err(|e| Error::Dispatch(format!("cannot create remote job {}: {}", self.job.name, e)))?;
        info!(job = %self.job.name, record = %record.id, "Dispatched remote job");
        Ok(record.id)
    }

    async fn wait_remote(&mut self, id: RecordId, cancel: &CancellationToken) -> Result<RemoteJobRecord> {
        let deadline = self.deadline();
        let settings = self.services.settings.wait;
        let repo = self.services.remote_jobs.clone();

        wait_remote_start(repo.as_ref(), id, deadline, settings, cancel).await?;
        self.job.advance_status(JobStatus::Running);
        self.acknowledge();

        wait_remote_end(repo.as_ref(), id, deadline, settings, cancel).await
    }

    /// Outputs come from the record whatever the wait ended with, so a
    /// timed out or cancelled job keeps what the agent reported so far.
    async fn complete_remote(&mut self, id: RecordId) {
        match self.services.remote_jobs.find_by_id(id).await {
            Ok(Some(record)) => {
                for output in record.outputs {
                    self.job.set_output(&output.name, output.value);
                }
            }
            Ok(None) => self.fail(Error::Completion(format!("remote job record {} is gone", id))),
            Err(e) => self.fail(Error::Completion(format!("cannot read remote job {}: {}", id, e))),
        }
        self.summarize().await;
    }

    // Shared completion

    fn finish_with(&mut self, status: JobStatus) {
        if status == JobStatus::Passed {
            self.job.advance_status(status);
        } else {
            self.job.record_error(status, format!("executor reported {}", status));
        }
    }

    async fn summarize(&mut self) {
        let mut paths = self.spec.properties.paths.clone();
        let result = self
            .services
            .steps
            .summarize(&self.run, &mut paths, &self.job.name, &mut self.spec.steps)
            .await;
        self.spec.properties.paths = paths;
        if let Err(e) = result {
            self.fail(Error::Completion(format!("cannot summarize steps: {}", e)));
        }
    }
}

#[async_trait]
impl JobCtl for FreestyleJobCtl {
    async fn run(&mut self, cancel: &CancellationToken) {
        if let Err(e) = self.prepare().await {
            self.fail(e);
            return;
        }
        self.acknowledge();

        if cancel.is_cancelled() {
            self.fail(Error::Cancelled);
            return;
        }

        match self.job.infrastructure() {
            Infrastructure::Kubernetes => self.run_cluster(cancel).await,
            Infrastructure::Vm => self.run_remote(cancel).await,
        }
    }

    async fn save_info(&self, repo: &dyn JobInfoRepo) -> DbResult<()> {
        save_job_info(&self.job, &self.run, repo).await
    }

    fn job_mut(&mut self) -> &mut JobTask {
        &mut self.job
    }

    fn into_job(self: Box<Self>) -> JobTask {
        self.job
    }
}
