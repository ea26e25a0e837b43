//! Jobs dispatched to remote VM agents.
//!
//! A record is the whole contract with the agent: the serialized execution
//! context goes in, status and outputs come back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::RecordId;
use shipyard_core::cluster::OutputValue;
use shipyard_core::job::JobStatus;
use sqlx::PgPool;
use sqlx::types::Json;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJobRecord {
    pub id: RecordId,
    pub project: String,
    pub workflow: String,
    pub run_id: u64,
    pub job_name: String,
    pub job_type: String,
    pub origin_job_name: String,
    /// Serialized execution context.
    pub job_ctx: String,
    /// An agent must carry all of these to pick the job up.
    pub labels: Vec<String>,
    pub status: JobStatus,
    pub outputs: Vec<OutputValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteJobRecord {
    /// A fresh `created` record with a new id.
    pub fn new(
        project: impl Into<String>,
        workflow: impl Into<String>,
        run_id: u64,
        job_name: impl Into<String>,
        job_type: impl Into<String>,
        job_ctx: impl Into<String>,
    ) -> Self {
        let job_name = job_name.into();
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            project: project.into(),
            workflow: workflow.into(),
            run_id,
            origin_job_name: job_name.clone(),
            job_name,
            job_type: job_type.into(),
            job_ctx: job_ctx.into(),
            labels: Vec::new(),
            status: JobStatus::Created,
            outputs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RemoteJobRow {
    id: uuid::Uuid,
    project: String,
    workflow: String,
    run_id: i64,
    job_name: String,
    job_type: String,
    origin_job_name: String,
    job_ctx: String,
    labels: Json<Vec<String>>,
    status: String,
    outputs: Json<Vec<OutputValue>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RemoteJobRow> for RemoteJobRecord {
    type Error = DbError;

    fn try_from(row: RemoteJobRow) -> DbResult<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e| DbError::InvalidData(format!("remote job {}: {}", row.id, e)))?;
        let run_id = u64::try_from(row.run_id)
            .map_err(|_| DbError::InvalidData(format!("remote job {}: negative run id", row.id)))?;
        Ok(Self {
            id: RecordId::from(row.id),
            project: row.project,
            workflow: row.workflow,
            run_id,
            job_name: row.job_name,
            job_type: row.job_type,
            origin_job_name: row.origin_job_name,
            job_ctx: row.job_ctx,
            labels: row.labels.0,
            status,
            outputs: row.outputs.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
pub trait RemoteJobRepo: Send + Sync {
    async fn create(&self, record: &RemoteJobRecord) -> DbResult<()>;

    async fn find_by_id(&self, id: RecordId) -> DbResult<Option<RemoteJobRecord>>;

    /// Overwrite the status. `NotFound` when the record is gone.
    async fn update_status(&self, id: RecordId, status: JobStatus) -> DbResult<()>;

    /// Deleting a missing record is not an error.
    async fn delete_by_id(&self, id: RecordId) -> DbResult<()>;
}

/// PostgreSQL implementation of RemoteJobRepo.
pub struct PgRemoteJobRepo {
    pool: PgPool,
}

impl PgRemoteJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RemoteJobRepo for PgRemoteJobRepo {
    async fn create(&self, record: &RemoteJobRecord) -> DbResult<()> {
        let run_id = i64::try_from(record.run_id)
            .map_err(|_| DbError::InvalidData(format!("run id {} out of range", record.run_id)))?;
        sqlx::query(
            r#"
            INSERT INTO remote_jobs (id, project, workflow, run_id, job_name, job_type,
                                     origin_job_name, job_ctx, labels, status, outputs,
                                     created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.project)
        .bind(&record.workflow)
        .bind(run_id)
        .bind(&record.job_name)
        .bind(&record.job_type)
        .bind(&record.origin_job_name)
        .bind(&record.job_ctx)
        .bind(Json(&record.labels))
        .bind(record.status.as_str())
        .bind(Json(&record.outputs))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("remote job {}", record.id))
            }
            other => DbError::Database(other),
        })?;
        Ok(())
    }

    async fn find_by_id(&self, id: RecordId) -> DbResult<Option<RemoteJobRecord>> {
        let row = sqlx::query_as::<_, RemoteJobRow>(
            r#"
            SELECT id, project, workflow, run_id, job_name, job_type, origin_job_name,
                   job_ctx, labels, status, outputs, created_at, updated_at
            FROM remote_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(RemoteJobRecord::try_from).transpose()
    }

    async fn update_status(&self, id: RecordId, status: JobStatus) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE remote_jobs SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("remote job {}", id)));
        }
        Ok(())
    }

    async fn delete_by_id(&self, id: RecordId) -> DbResult<()> {
        sqlx::query("DELETE FROM remote_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
