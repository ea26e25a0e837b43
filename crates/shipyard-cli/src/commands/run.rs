//! Batch job execution command.

use anyhow::{Context, Result};
use serde::Deserialize;
use shipyard_config::SystemConfig;
use shipyard_core::{JobTask, WorkflowRunContext};
use shipyard_db::{
    JobInfoRepo, JobLogRepo, MemoryJobInfoRepo, MemoryJobLogRepo, MemoryRemoteJobRepo,
    PgJobInfoRepo, PgJobLogRepo, PgRemoteJobRepo, RemoteJobRepo,
};
use shipyard_executor::{DefaultImageResolver, DockerHosts, KubeClusterProvider};
use shipyard_scheduler::{Ack, BasicStepRunner, ControllerSettings, JobServices, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub struct RunOptions {
    pub jobs: PathBuf,
    pub concurrency: usize,
    pub database_url: Option<String>,
    pub in_memory: bool,
}

/// A run file: the run's metadata plus the jobs to execute.
#[derive(Debug, Deserialize)]
pub struct RunFile {
    pub run: WorkflowRunContext,
    pub jobs: Vec<JobTask>,
}

impl RunFile {
    /// Parse a run file. Jobs without a key or origin name take their own
    /// name for both.
    pub fn parse(text: &str) -> Result<Self> {
        let mut file: RunFile = serde_json::from_str(text).context("Invalid run file")?;
        for job in &mut file.jobs {
            if job.key.is_empty() {
                job.key = job.name.clone();
            }
            if job.origin_name.is_empty() {
                job.origin_name = job.name.clone();
            }
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;
        Self::parse(&text)
    }
}

struct Repos {
    remote_jobs: Arc<dyn RemoteJobRepo>,
    job_infos: Arc<dyn JobInfoRepo>,
    logs: Arc<dyn JobLogRepo>,
}

async fn connect_repos(options: &RunOptions) -> Result<Repos> {
    if options.in_memory {
        return Ok(Repos {
            remote_jobs: Arc::new(MemoryRemoteJobRepo::new()),
            job_infos: Arc::new(MemoryJobInfoRepo::new()),
            logs: Arc::new(MemoryJobLogRepo::new()),
        });
    }

    let url = options
        .database_url
        .as_deref()
        .context("No database URL configured, pass --database-url or --in-memory")?;
    let pool = shipyard_db::create_pool(url)
        .await
        .context("Failed to connect to database")?;
    shipyard_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok(Repos {
        remote_jobs: Arc::new(PgRemoteJobRepo::new(pool.clone())),
        job_infos: Arc::new(PgJobInfoRepo::new(pool.clone())),
        logs: Arc::new(PgJobLogRepo::new(pool)),
    })
}

/// Run every job of the run file and print the outcome. Fails when any
/// job did not pass.
pub async fn run(config: &SystemConfig, options: RunOptions) -> Result<()> {
    let RunFile { run, mut jobs } = RunFile::load(&options.jobs)?;
    let repos = connect_repos(&options).await?;
    let cleanup = TaskTracker::new();

    let services = JobServices {
        steps: Arc::new(BasicStepRunner::new()),
        remote_jobs: repos.remote_jobs,
        job_infos: repos.job_infos,
        logs: repos.logs,
        clusters: Arc::new(KubeClusterProvider::new(config.hub_server.clone())),
        docker_hosts: Arc::new(DockerHosts::new(config.docker_hosts.clone())),
        images: Arc::new(DefaultImageResolver::new(config.base_image_registry.clone())),
        settings: ControllerSettings::from_config(config),
        cleanup: cleanup.clone(),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling jobs");
            on_signal.cancel();
        }
    });

    let ack: Ack = Arc::new(|job: &JobTask| {
        info!(job = %job.name, status = %job.status(), "Job status changed");
    });

    info!(
        workflow = %run.workflow_name,
        run = run.run_id,
        jobs = jobs.len(),
        "Starting run"
    );
    let pool = WorkerPool::new(services);
    pool.run_jobs(&mut jobs, Arc::new(run), options.concurrency, ack, cancel)
        .await;

    cleanup.close();
    cleanup.wait().await;

    println!("\n--- Job Summary ---");
    for job in &jobs {
        match &job.error {
            Some(error) => println!("  {} - {}: {}", job.name, job.status(), error),
            None => println!("  {} - {}", job.name, job.status()),
        }
    }

    let failed = jobs
        .iter()
        .filter(|j| j.status() != shipyard_core::JobStatus::Passed)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} jobs did not pass", failed, jobs.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::{Infrastructure, JobStatus, JobType};

    #[test]
    fn test_parse_run_file() {
        let text = r#"{
            "run": {
                "run_id": 12,
                "workflow_name": "release",
                "workspace": "/workspace",
                "project_name": "shop"
            },
            "jobs": [
                {
                    "name": "build",
                    "job_type": "freestyle",
                    "infrastructure": "kubernetes",
                    "status": "created",
                    "spec": {}
                }
            ]
        }"#;

        let file = RunFile::parse(text).unwrap();
        assert_eq!(file.run.run_id, 12);
        assert_eq!(file.run.workflow_display_name, "");
        assert_eq!(file.jobs.len(), 1);
        assert_eq!(file.jobs[0].job_type, JobType::Freestyle);
        assert_eq!(file.jobs[0].infrastructure(), Infrastructure::Kubernetes);
        assert_eq!(file.jobs[0].status(), JobStatus::Created);
        assert_eq!(file.jobs[0].key, "build");
        assert_eq!(file.jobs[0].origin_name, "build");
    }

    #[test]
    fn test_rejects_malformed_run_file() {
        assert!(RunFile::parse(r#"{"jobs": []}"#).is_err());
    }

    #[tokio::test]
    async fn test_database_required_unless_in_memory() {
        let options = RunOptions {
            jobs: PathBuf::from("run.json"),
            concurrency: 1,
            database_url: None,
            in_memory: false,
        };
        assert!(connect_repos(&options).await.is_err());

        let options = RunOptions {
            in_memory: true,
            ..options
        };
        assert!(connect_repos(&options).await.is_ok());
    }
}
