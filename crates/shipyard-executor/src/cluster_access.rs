//! Access to the local cluster and to attached clusters.
//!
//! Attached clusters are reached through the hub server, which proxies the
//! Kubernetes API of each connected agent under `/api/hub/kube/<id>`.

use async_trait::async_trait;
use kube::{Client, Config};
use shipyard_core::cluster::{ClusterBackend, ClusterProvider};
use shipyard_core::job::LOCAL_CLUSTER_ID;
use shipyard_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::resources::KubeBackend;

/// Connects to clusters by id. One backend (and its watches) is kept per
/// cluster for the lifetime of the provider.
pub struct KubeClusterProvider {
    hub_server: String,
    backends: Mutex<HashMap<String, Arc<KubeBackend>>>,
}

impl KubeClusterProvider {
    pub fn new(hub_server: impl Into<String>) -> Self {
        Self {
            hub_server: hub_server.into(),
            backends: Mutex::new(HashMap::new()),
        }
    }

    fn hub_url(&self, cluster_id: &str) -> String {
        format!(
            "{}/api/hub/kube/{}",
            self.hub_server.trim_end_matches('/'),
            cluster_id
        )
    }

    async fn client_for(&self, cluster_id: &str) -> Result<Client> {
        if cluster_id == LOCAL_CLUSTER_ID {
            return Client::try_default()
                .await
                .map_err(|e| Error::Cluster(format!("cannot connect to local cluster: {}", e)));
        }

        let url = self.hub_url(cluster_id);
        let uri = url
            .parse()
            .map_err(|e| Error::Cluster(format!("invalid hub url {}: {}", url, e)))?;
        Client::try_from(Config::new(uri))
            .map_err(|e| Error::Cluster(format!("cannot connect to cluster {}: {}", cluster_id, e)))
    }
}

#[async_trait]
impl ClusterProvider for KubeClusterProvider {
    async fn connect(&self, cluster_id: &str) -> Result<Arc<dyn ClusterBackend>> {
        let mut backends = self.backends.lock().await;
        if let Some(backend) = backends.get(cluster_id) {
            return Ok(backend.clone());
        }

        let client = self.client_for(cluster_id).await?;
        info!(cluster = %cluster_id, "Connected to cluster");
        let backend = Arc::new(KubeBackend::new(cluster_id, client));
        backends.insert(cluster_id.to_string(), backend.clone());
        Ok(backend)
    }
}
