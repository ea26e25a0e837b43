//! Remote agent jobs, followed by polling their record.

use shipyard_core::job::JobStatus;
use shipyard_core::{Error, RecordId, Result};
use shipyard_db::{RemoteJobRecord, RemoteJobRepo};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::WaitSettings;

/// Tell the agent to stop by writing the interrupting status to the record.
/// A failed write only loses the stop signal, so it is logged.
async fn interrupted(repo: &dyn RemoteJobRepo, id: RecordId, error: Error) -> Error {
    let status = error.job_status();
    if let Err(e) = repo.update_status(id, status).await {
        warn!(record = %id, status = %status, error = %e, "Failed to write status to remote job");
    }
    error
}

async fn poll_until<F>(
    repo: &dyn RemoteJobRepo,
    id: RecordId,
    deadline: Instant,
    settings: WaitSettings,
    cancel: &CancellationToken,
    phase: &str,
    done: F,
) -> Result<RemoteJobRecord>
where
    F: Fn(JobStatus) -> bool,
{
    loop {
        match repo.find_by_id(id).await {
            Ok(Some(record)) if done(record.status) => return Ok(record),
            Ok(Some(_)) => {}
            Ok(None) => return Err(Error::NotFound(format!("remote job record {}", id))),
            Err(e) => debug!(record = %id, error = %e, "Remote job poll failed"),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(interrupted(repo, id, Error::Cancelled).await);
            }
            _ = sleep_until(deadline) => {
                let error = Error::Timeout(format!("remote job {} did not {} in time", id, phase));
                return Err(interrupted(repo, id, error).await);
            }
            _ = sleep(settings.poll_interval) => {}
        }
    }
}

/// Wait until an agent picked the job up. Returns its status at that point,
/// which may already be terminal.
pub async fn wait_remote_start(
    repo: &dyn RemoteJobRepo,
    id: RecordId,
    deadline: Instant,
    settings: WaitSettings,
    cancel: &CancellationToken,
) -> Result<JobStatus> {
    let record = poll_until(repo, id, deadline, settings, cancel, "start", |s| {
        s != JobStatus::Created
    })
    .await?;
    Ok(record.status)
}

/// Wait until the record reaches a terminal status.
pub async fn wait_remote_end(
    repo: &dyn RemoteJobRepo,
    id: RecordId,
    deadline: Instant,
    settings: WaitSettings,
    cancel: &CancellationToken,
) -> Result<RemoteJobRecord> {
    poll_until(repo, id, deadline, settings, cancel, "finish", JobStatus::is_terminal).await
}
