//! Bounded-concurrency execution of a run's jobs.

use chrono::Utc;
use shipyard_core::job::JobStatus;
use shipyard_core::{JobTask, WorkflowRunContext};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controller::{Ack, run_job};
use crate::services::JobServices;

type Queue = Arc<Mutex<mpsc::UnboundedReceiver<(usize, JobTask)>>>;

pub struct WorkerPool {
    services: JobServices,
}

impl WorkerPool {
    pub fn new(services: JobServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &JobServices {
        &self.services
    }

    /// Run every job to a terminal status with at most `concurrency` jobs
    /// in flight. Finished jobs are written back in place. A failing job
    /// does not stop the others.
    pub async fn run_jobs(
        &self,
        jobs: &mut [JobTask],
        run: Arc<WorkflowRunContext>,
        concurrency: usize,
        ack: Ack,
        cancel: CancellationToken,
    ) {
        if jobs.is_empty() {
            return;
        }
        let workers = concurrency.clamp(1, jobs.len());
        info!(run = run.run_id, jobs = jobs.len(), workers, "Running jobs");

        let (tx, rx) = mpsc::unbounded_channel();
        for (index, job) in jobs.iter().enumerate() {
            // The receiver is alive, so sending cannot fail.
            let _ = tx.send((index, job.clone()));
        }
        drop(tx);
        let queue: Queue = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(work(
                worker,
                queue.clone(),
                run.clone(),
                self.services.clone(),
                ack.clone(),
                cancel.clone(),
            ));
        }

        while let Some(result) = set.join_next().await {
            match result {
                Ok(finished) => {
                    for (index, job) in finished {
                        jobs[index] = job;
                    }
                }
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        self.services.docker_hosts.release_run(&run.run_id.to_string());
    }
}

async fn work(
    worker: usize,
    queue: Queue,
    run: Arc<WorkflowRunContext>,
    services: JobServices,
    ack: Ack,
    cancel: CancellationToken,
) -> Vec<(usize, JobTask)> {
    let mut finished = Vec::new();
    loop {
        let next = queue.lock().await.recv().await;
        let Some((index, job)) = next else {
            break;
        };

        let fallback = job.clone();
        let handle = tokio::spawn(run_job(
            job,
            run.clone(),
            services.clone(),
            ack.clone(),
            cancel.clone(),
        ));
        let job = match handle.await {
            Ok(job) => job,
            Err(e) => {
                error!(worker, job = %fallback.name, error = %e, "Job controller panicked");
                let mut job = fallback;
                job.start_time.get_or_insert_with(Utc::now);
                job.record_error(JobStatus::Failed, "job controller panicked");
                job.end_time = Some(Utc::now());
                ack(&job);
                job
            }
        };
        finished.push((index, job));
    }
    finished
}
