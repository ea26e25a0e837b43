//! Docker daemon sidecar selection.
//!
//! Build steps talk to a `dind` sidecar. All jobs of one run stick to the
//! same sidecar so layer caches are shared; new runs go to the sidecar
//! currently serving the fewest runs.

use shipyard_core::infra::DockerHostSelector;
use shipyard_core::job::LOCAL_CLUSTER_ID;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// Used when a cluster has no sidecars configured.
pub const FALLBACK_DOCKER_HOST: &str = "tcp://dind-0.dind:2375";

const DIND_SERVICE: &str = ".dind";

pub struct DockerHosts {
    hosts: BTreeMap<String, Vec<String>>,
    // (cluster id, run key) -> host
    assigned: Mutex<HashMap<(String, String), String>>,
}

impl DockerHosts {
    pub fn new(hosts: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            hosts,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    fn load(assigned: &HashMap<(String, String), String>, cluster_id: &str, host: &str) -> usize {
        assigned
            .iter()
            .filter(|((cluster, _), h)| cluster == cluster_id && h.as_str() == host)
            .count()
    }
}

impl DockerHostSelector for DockerHosts {
    fn best_host(&self, cluster_id: &str, run_key: &str) -> String {
        let candidates = match self.hosts.get(cluster_id) {
            Some(hosts) if !hosts.is_empty() => hosts,
            _ => return FALLBACK_DOCKER_HOST.to_string(),
        };

        let mut assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
        let key = (cluster_id.to_string(), run_key.to_string());
        if let Some(host) = assigned.get(&key) {
            return host.clone();
        }

        // min_by_key keeps the first minimum, so ties go to declaration order.
        let Some(host) = candidates
            .iter()
            .min_by_key(|h| Self::load(&assigned, cluster_id, h))
            .cloned()
        else {
            return FALLBACK_DOCKER_HOST.to_string();
        };
        debug!(cluster = %cluster_id, run = %run_key, host = %host, "Assigned docker host");
        assigned.insert(key, host.clone());
        host
    }

    fn release_run(&self, run_key: &str) {
        let mut assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
        assigned.retain(|(_, run), _| run != run_key);
    }
}

/// Namespace a sidecar address is qualified with: the label after `.dind.`
/// up to the port, path or end of the host.
fn qualifier(host: &str) -> Option<&str> {
    let marker = format!("{}.", DIND_SERVICE);
    let start = host.find(&marker)? + marker.len();
    let rest = &host[start..];
    let end = rest.find([':', '/', '.']).unwrap_or(rest.len());
    Some(&rest[..end]).filter(|ns| !ns.is_empty())
}

/// Qualify a sidecar address with the namespace the job runs in.
///
/// Sidecars are addressed as `<pod>.dind`, which only resolves from the
/// platform namespace. Local jobs run in the platform namespace and jobs on
/// attached clusters in the agent namespace. A host already qualified with
/// the target namespace is kept, one qualified with another namespace is
/// moved over and a bare one gets `.dind.<target>`.
pub fn route_docker_host(
    host: &str,
    cluster_id: &str,
    platform_namespace: &str,
    agent_namespace: &str,
) -> String {
    let target = if cluster_id == LOCAL_CLUSTER_ID || cluster_id.is_empty() {
        platform_namespace
    } else {
        agent_namespace
    };
    let qualified = format!("{}.{}", DIND_SERVICE, target);

    match qualifier(host) {
        Some(ns) if ns == target => host.to_string(),
        Some(ns) => host.replacen(&format!("{}.{}", DIND_SERVICE, ns), &qualified, 1),
        None => host.replacen(DIND_SERVICE, &qualified, 1),
    }
}
