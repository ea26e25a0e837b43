//! Container log storage for finished cluster jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// One stored log line.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobLogRecord {
    pub id: uuid::Uuid,
    pub workflow_name: String,
    pub run_id: i64,
    pub job_name: String,
    pub line_no: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait JobLogRepo: Send + Sync {
    /// Store the full log text of a job, one row per line.
    async fn save_log(
        &self,
        workflow_name: &str,
        run_id: u64,
        job_name: &str,
        content: &str,
    ) -> DbResult<()>;

    /// Joined log text of a job, empty when nothing was saved.
    async fn logs_for_job(&self, workflow_name: &str, run_id: u64, job_name: &str)
    -> DbResult<String>;
}

/// PostgreSQL implementation of JobLogRepo.
pub struct PgJobLogRepo {
    pool: PgPool,
}

impl PgJobLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_run_id(run_id: u64) -> DbResult<i64> {
    i64::try_from(run_id).map_err(|_| DbError::InvalidData(format!("run id {} out of range", run_id)))
}

#[async_trait]
impl JobLogRepo for PgJobLogRepo {
    async fn save_log(
        &self,
        workflow_name: &str,
        run_id: u64,
        job_name: &str,
        content: &str,
    ) -> DbResult<()> {
        if content.is_empty() {
            return Ok(());
        }
        let run_id = db_run_id(run_id)?;

        // Postgres caps bind parameters per statement, so insert in chunks.
        let lines: Vec<(i64, &str)> = content.lines().zip(0i64..).map(|(l, n)| (n, l)).collect();
        for chunk in lines.chunks(1000) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO job_logs (id, workflow_name, run_id, job_name, line_no, content, timestamp) ",
            );
            query_builder.push_values(chunk.iter(), |mut b, (line_no, line)| {
                b.push_bind(uuid::Uuid::now_v7())
                    .push_bind(workflow_name)
                    .push_bind(run_id)
                    .push_bind(job_name)
                    .push_bind(*line_no)
                    .push_bind(*line)
                    .push("NOW()");
            });
            query_builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn logs_for_job(
        &self,
        workflow_name: &str,
        run_id: u64,
        job_name: &str,
    ) -> DbResult<String> {
        let records = sqlx::query_as::<_, JobLogRecord>(
            r#"
            SELECT id, workflow_name, run_id, job_name, line_no, content, timestamp
            FROM job_logs
            WHERE workflow_name = $1 AND run_id = $2 AND job_name = $3
            ORDER BY line_no ASC
            "#,
        )
        .bind(workflow_name)
        .bind(db_run_id(run_id)?)
        .bind(job_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(records
            .into_iter()
            .map(|r| r.content)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
