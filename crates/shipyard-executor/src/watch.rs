//! Completion watchers.
//!
//! Cluster jobs are followed through a cached watch over the namespace,
//! remote agent jobs by polling their record. Both race every wait against
//! cancellation and one deadline shared by the start and end waits.

pub mod cluster;
pub mod remote;

pub use cluster::{ClusterWatch, wait_job_end, wait_job_start};
pub use remote::{wait_remote_end, wait_remote_start};

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    /// Interval between cache reads or record polls.
    pub poll_interval: Duration,
    /// How long a finished cluster job may go without a sentinel.
    pub sentinel_grace: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            sentinel_grace: Duration::from_secs(10),
        }
    }
}
