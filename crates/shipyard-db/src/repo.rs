//! Repository traits and implementations.

pub mod job_info;
pub mod logs;
pub mod remote_job;

pub use job_info::{JobInfo, JobInfoRepo, PgJobInfoRepo};
pub use logs::{JobLogRecord, JobLogRepo, PgJobLogRepo};
pub use remote_job::{PgRemoteJobRepo, RemoteJobRecord, RemoteJobRepo};
