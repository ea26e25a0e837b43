//! Audit rows written once per finished job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::job::JobStatus;
use shipyard_core::{JobTask, RecordId, WorkflowRunContext};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: RecordId,
    pub job_type: String,
    pub workflow_name: String,
    pub workflow_display_name: String,
    pub run_id: u64,
    pub project: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub status: JobStatus,
}

impl JobInfo {
    pub fn from_job(job: &JobTask, run: &WorkflowRunContext) -> Self {
        Self {
            id: RecordId::new(),
            job_type: job.job_type.as_str().to_string(),
            workflow_name: run.workflow_name.clone(),
            workflow_display_name: run.workflow_display_name.clone(),
            run_id: run.run_id,
            project: run.project_name.clone(),
            start_time: job.start_time,
            end_time: job.end_time,
            duration_secs: job.duration_secs(),
            status: job.status(),
        }
    }
}

#[async_trait]
pub trait JobInfoRepo: Send + Sync {
    async fn create(&self, info: &JobInfo) -> DbResult<()>;
}

/// PostgreSQL implementation of JobInfoRepo.
pub struct PgJobInfoRepo {
    pool: PgPool,
}

impl PgJobInfoRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobInfoRepo for PgJobInfoRepo {
    async fn create(&self, info: &JobInfo) -> DbResult<()> {
        let run_id = i64::try_from(info.run_id)
            .map_err(|_| DbError::InvalidData(format!("run id {} out of range", info.run_id)))?;
        sqlx::query(
            r#"
            INSERT INTO job_infos (id, job_type, workflow_name, workflow_display_name, run_id,
                                   project, start_time, end_time, duration_secs, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(info.id.as_uuid())
        .bind(&info.job_type)
        .bind(&info.workflow_name)
        .bind(&info.workflow_display_name)
        .bind(run_id)
        .bind(&info.project)
        .bind(info.start_time)
        .bind(info.end_time)
        .bind(info.duration_secs)
        .bind(info.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
