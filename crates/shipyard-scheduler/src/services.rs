//! Collaborators shared by every controller of a run.

use shipyard_config::SystemConfig;
use shipyard_core::cluster::ClusterProvider;
use shipyard_core::infra::{DockerHostSelector, ImageResolver};
use shipyard_core::step::StepRunner;
use shipyard_db::{JobInfoRepo, JobLogRepo, RemoteJobRepo};
use shipyard_executor::WaitSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Namespace of jobs on the local cluster.
    pub namespace: String,
    /// Namespace of jobs on attached clusters.
    pub agent_namespace: String,
    pub wait: WaitSettings,
}

impl ControllerSettings {
    pub fn from_config(config: &SystemConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            agent_namespace: config.agent_namespace.clone(),
            wait: WaitSettings {
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                sentinel_grace: Duration::from_secs(config.sentinel_grace_secs),
            },
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&SystemConfig::default())
    }
}

#[derive(Clone)]
pub struct JobServices {
    pub steps: Arc<dyn StepRunner>,
    pub remote_jobs: Arc<dyn RemoteJobRepo>,
    pub job_infos: Arc<dyn JobInfoRepo>,
    pub logs: Arc<dyn JobLogRepo>,
    pub clusters: Arc<dyn ClusterProvider>,
    pub docker_hosts: Arc<dyn DockerHostSelector>,
    pub images: Arc<dyn ImageResolver>,
    pub settings: ControllerSettings,
    /// Background cleanup of finished jobs. Callers close and wait on it
    /// before shutting down.
    pub cleanup: TaskTracker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = SystemConfig {
            poll_interval_ms: 250,
            sentinel_grace_secs: 3,
            ..Default::default()
        };
        let settings = ControllerSettings::from_config(&config);
        assert_eq!(settings.namespace, "shipyard");
        assert_eq!(settings.wait.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.wait.sentinel_grace, Duration::from_secs(3));
    }
}
