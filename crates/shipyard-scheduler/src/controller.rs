//! Job lifecycle controllers.
//!
//! One controller per job type, all behind [`JobCtl`]. The only place that
//! knows the set of job types is [`instantiate`].

pub mod freestyle;

pub use freestyle::FreestyleJobCtl;

use async_trait::async_trait;
use chrono::Utc;
use shipyard_core::job::{JobStatus, JobType};
use shipyard_core::{JobTask, WorkflowRunContext};
use shipyard_db::{DbResult, JobInfo, JobInfoRepo};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::services::JobServices;

/// Called with the job whenever its status becomes visible to the caller:
/// after prepare, once running, and once terminal.
pub type Ack = Arc<dyn Fn(&JobTask) + Send + Sync>;

#[async_trait]
pub trait JobCtl: Send {
    /// Drive the job to a terminal status. Failures end up on the job,
    /// never in a return value.
    async fn run(&mut self, cancel: &CancellationToken);

    /// Write the job's audit row.
    async fn save_info(&self, repo: &dyn JobInfoRepo) -> DbResult<()>;

    fn job_mut(&mut self) -> &mut JobTask;

    fn into_job(self: Box<Self>) -> JobTask;
}

/// Controller for a job type.
pub fn instantiate(
    job: JobTask,
    run: Arc<WorkflowRunContext>,
    services: JobServices,
    ack: Ack,
) -> Box<dyn JobCtl> {
    match job.job_type {
        JobType::Freestyle | JobType::Build | JobType::Test | JobType::Scanning => {
            Box::new(FreestyleJobCtl::new(job, run, services, ack))
        }
        JobType::Deploy => Box::new(UnsupportedJobCtl { job, run }),
    }
}

/// Run one job start to finish and hand it back terminal.
pub async fn run_job(
    mut job: JobTask,
    run: Arc<WorkflowRunContext>,
    services: JobServices,
    ack: Ack,
    cancel: CancellationToken,
) -> JobTask {
    job.start_time = Some(Utc::now());
    info!(job = %job.name, job_type = %job.job_type, infra = job.infrastructure().as_str(), "Starting job");

    let repo = services.job_infos.clone();
    let mut ctl = instantiate(job, run, services, ack.clone());
    ctl.run(&cancel).await;

    let job = ctl.job_mut();
    if !job.status().is_terminal() {
        job.record_error(JobStatus::Failed, "job ended without a terminal status");
    }
    job.end_time = Some(Utc::now());
    if let Err(e) = ctl.save_info(repo.as_ref()).await {
        warn!(error = %e, "Failed to save job info");
    }

    let job = ctl.into_job();
    info!(
        job = %job.name,
        status = %job.status(),
        error = job.error.as_deref().unwrap_or(""),
        "Job finished"
    );
    ack(&job);
    job
}

/// Audit row of a finished job.
pub(crate) async fn save_job_info(
    job: &JobTask,
    run: &WorkflowRunContext,
    repo: &dyn JobInfoRepo,
) -> DbResult<()> {
    repo.create(&JobInfo::from_job(job, run)).await
}

/// Job types that are declared but have no controller.
struct UnsupportedJobCtl {
    job: JobTask,
    run: Arc<WorkflowRunContext>,
}

#[async_trait]
impl JobCtl for UnsupportedJobCtl {
    async fn run(&mut self, _cancel: &CancellationToken) {
        let message = format!("unsupported job type: {}", self.job.job_type);
        warn!(job = %self.job.name, "{}", message);
        self.job.record_error(JobStatus::Failed, message);
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
