//! In-memory repositories.
//!
//! Used by the CLI's `--in-memory` mode and by tests across the workspace.
//! A remote agent is simulated with [`MemoryRemoteJobRepo::report`].

use async_trait::async_trait;
use chrono::Utc;
use shipyard_core::RecordId;
use shipyard_core::cluster::OutputValue;
use shipyard_core::job::JobStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::repo::{JobInfo, JobInfoRepo, JobLogRepo, RemoteJobRecord, RemoteJobRepo};
use crate::{DbError, DbResult};

#[derive(Default)]
pub struct MemoryRemoteJobRepo {
    records: RwLock<HashMap<RecordId, RemoteJobRecord>>,
    fail_status_writes: AtomicBool,
    fail_creates: AtomicBool,
}

impl MemoryRemoteJobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// What an agent does: report a status and, optionally, outputs.
    pub async fn report(
        &self,
        id: RecordId,
        status: JobStatus,
        outputs: Vec<OutputValue>,
    ) -> DbResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("remote job {}", id)))?;
        record.status = status;
        if !outputs.is_empty() {
            record.outputs = outputs;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Make every later `update_status` call fail.
    pub fn fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every later `create` call fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<RemoteJobRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// The record of a job by name, if it still exists.
    pub async fn find_by_job_name(&self, job_name: &str) -> Option<RemoteJobRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.job_name == job_name)
            .cloned()
    }
}

#[async_trait]
impl RemoteJobRepo for MemoryRemoteJobRepo {
    async fn create(&self, record: &RemoteJobRecord) -> DbResult<()> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(DbError::InvalidData("inserts disabled".to_string()));
        }
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(DbError::Duplicate(format!("remote job {}", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: RecordId) -> DbResult<Option<RemoteJobRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_status(&self, id: RecordId, status: JobStatus) -> DbResult<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(DbError::InvalidData("status writes disabled".to_string()));
        }
        self.report(id, status, Vec::new()).await
    }

    async fn delete_by_id(&self, id: RecordId) -> DbResult<()> {
        self.records.write().await.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryJobInfoRepo {
    infos: RwLock<Vec<JobInfo>>,
}

impl MemoryJobInfoRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<JobInfo> {
        self.infos.read().await.clone()
    }
}

#[async_trait]
impl JobInfoRepo for MemoryJobInfoRepo {
    async fn create(&self, info: &JobInfo) -> DbResult<()> {
        self.infos.write().await.push(info.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryJobLogRepo {
    logs: RwLock<HashMap<(String, u64, String), String>>,
    fail_saves: AtomicBool,
}

impl MemoryJobLogRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `save_log` call fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobLogRepo for MemoryJobLogRepo {
    async fn save_log(
        &self,
        workflow_name: &str,
        run_id: u64,
        job_name: &str,
        content: &str,
    ) -> DbResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(DbError::InvalidData("log writes disabled".to_string()));
        }
        let key = (workflow_name.to_string(), run_id, job_name.to_string());
        let mut logs = self.logs.write().await;
        let entry = logs.entry(key).or_default();
        if !entry.is_empty() && !content.is_empty() {
            entry.push('\n');
        }
        entry.push_str(content);
        Ok(())
    }

    async fn logs_for_job(
        &self,
        workflow_name: &str,
        run_id: u64,
        job_name: &str,
    ) -> DbResult<String> {
        let key = (workflow_name.to_string(), run_id, job_name.to_string());
        Ok(self.logs.read().await.get(&key).cloned().unwrap_or_default())
    }
}
