//! Kubernetes resources of a job: the Job, its context ConfigMap and the
//! registry pull Secrets.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use shipyard_core::cluster::{
    CONTEXT_KEY, ClusterBackend, ClusterJobRequest, JobLabel, JobObserver, LABEL_MANAGED_BY,
    MANAGED_BY,
};
use shipyard_core::job::RegistryNamespace;
use shipyard_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::watch::ClusterWatch;

/// Where the context ConfigMap is mounted in the executor container.
pub const CONTEXT_MOUNT_PATH: &str = "/shipyard/context";
const CONTEXT_VOLUME: &str = "job-context";
const EXECUTOR_CONTAINER: &str = "executor";
const FIELD_MANAGER: &str = "shipyard";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DELETE_POLL_ATTEMPTS: u32 = 60;

/// [`ClusterBackend`] for one Kubernetes cluster.
pub struct KubeBackend {
    cluster_id: String,
    client: Client,
    watches: Mutex<HashMap<String, Arc<ClusterWatch>>>,
}

impl KubeBackend {
    pub fn new(cluster_id: impl Into<String>, client: Client) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            client,
            watches: Mutex::new(HashMap::new()),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn cluster_err(what: impl std::fmt::Display, e: kube::Error) -> Error {
    Error::Cluster(format!("{}: {}", what, e))
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// Delete everything carrying `label` and poll until the list comes back
/// empty.
async fn ensure_delete<K>(api: &Api<K>, label: &JobLabel, kind: &str) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    let selector = label.selector();
    let lp = ListParams::default().labels(&selector);

    match api.delete_collection(&DeleteParams::background(), &lp).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(cluster_err(format!("delete {} {}", kind, selector), e)),
    }

    for _ in 0..DELETE_POLL_ATTEMPTS {
        let remaining = api
            .list(&lp)
            .await
            .map_err(|e| cluster_err(format!("list {} {}", kind, selector), e))?;
        if remaining.items.is_empty() {
            return Ok(());
        }
        debug!(kind, selector = %selector, left = remaining.items.len(), "Waiting for deletion");
        tokio::time::sleep(DELETE_POLL_INTERVAL).await;
    }

    Err(Error::Cluster(format!(
        "{} with labels {} still present after deletion",
        kind, selector
    )))
}

fn object_meta(namespace: &str, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

pub fn build_context_config_map(
    namespace: &str,
    name: &str,
    label: &JobLabel,
    context: &str,
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(namespace, name, label.labels()),
        data: Some(BTreeMap::from([(CONTEXT_KEY.to_string(), context.to_string())])),
        ..Default::default()
    }
}

/// DNS-1123 name of the pull secret for a registry.
pub fn registry_secret_name(registry: &RegistryNamespace) -> String {
    let mut name: String = format!("shipyard-registry-{}", registry.image_prefix())
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

pub fn build_registry_secret(namespace: &str, registry: &RegistryNamespace) -> Result<Secret> {
    let server = registry
        .reg_addr
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let mut auths = serde_json::Map::new();
    auths.insert(
        server.to_string(),
        json!({
            "username": registry.access_key,
            "password": registry.secret_key,
        }),
    );
    let config = json!({ "auths": auths });
    let config = serde_json::to_string(&config)
        .map_err(|e| Error::Internal(format!("cannot encode docker config: {}", e)))?;

    let labels = BTreeMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string())]);
    Ok(Secret {
        metadata: object_meta(namespace, &registry_secret_name(registry), labels),
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        string_data: Some(BTreeMap::from([(DOCKER_CONFIG_KEY.to_string(), config)])),
        ..Default::default()
    })
}

/// The Job running the executor image. It never retries: the executor
/// reports its own result and a rerun would repeat side effects of steps.
pub fn build_job_manifest(request: &ClusterJobRequest) -> Result<Job> {
    let labels = request.label.labels();
    let pull_secrets: Vec<_> = request
        .registries
        .iter()
        .map(|r| json!({ "name": registry_secret_name(r) }))
        .collect();
    let cpu = format!("{}m", request.resources.cpu_limit_millis);
    let memory = format!("{}Mi", request.resources.memory_limit_mib);

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
            "labels": labels,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "restartPolicy": "Never",
                    "imagePullSecrets": pull_secrets,
                    "containers": [{
                        "name": EXECUTOR_CONTAINER,
                        "image": request.image,
                        "imagePullPolicy": "Always",
                        "env": [
                            {
                                "name": "JOB_CONTEXT_FILE",
                                "value": format!("{}/{}", CONTEXT_MOUNT_PATH, CONTEXT_KEY),
                            },
                            { "name": "DOCKER_HOST", "value": request.docker_host },
                        ],
                        "resources": {
                            "limits": { "cpu": cpu, "memory": memory },
                        },
                        "volumeMounts": [{
                            "name": CONTEXT_VOLUME,
                            "mountPath": CONTEXT_MOUNT_PATH,
                        }],
                    }],
                    "volumes": [{
                        "name": CONTEXT_VOLUME,
                        "configMap": { "name": request.name },
                    }],
                },
            },
        },
    });

    serde_json::from_value(manifest)
        .map_err(|e| Error::Internal(format!("invalid job manifest for {}: {}", request.name, e)))
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn ensure_delete_config_maps(&self, namespace: &str, label: &JobLabel) -> Result<()> {
        ensure_delete(&self.api::<ConfigMap>(namespace), label, "configmaps").await
    }

    async fn create_context_config_map(
        &self,
        namespace: &str,
        name: &str,
        label: &JobLabel,
        context: &str,
    ) -> Result<()> {
        let cm = build_context_config_map(namespace, name, label, context);
        self.api::<ConfigMap>(namespace)
            .create(&PostParams::default(), &cm)
            .await
            .map_err(|e| cluster_err(format!("create configmap {}", name), e))?;
        debug!(cluster = %self.cluster_id, namespace, name, "Created context configmap");
        Ok(())
    }

    async fn ensure_delete_jobs(&self, namespace: &str, label: &JobLabel) -> Result<()> {
        ensure_delete(&self.api::<Job>(namespace), label, "jobs").await
    }

    async fn apply_registry_secrets(
        &self,
        namespace: &str,
        registries: &[RegistryNamespace],
    ) -> Result<()> {
        let api = self.api::<Secret>(namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for registry in registries {
            let secret = build_registry_secret(namespace, registry)?;
            let name = registry_secret_name(registry);
            api.patch(&name, &params, &Patch::Apply(&secret))
                .await
                .map_err(|e| cluster_err(format!("apply secret {}", name), e))?;
        }
        Ok(())
    }

    async fn create_job(&self, request: &ClusterJobRequest) -> Result<()> {
        let job = build_job_manifest(request)?;
        self.api::<Job>(&request.namespace)
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| cluster_err(format!("create job {}", request.name), e))?;
        info!(
            cluster = %self.cluster_id,
            namespace = %request.namespace,
            job = %request.name,
            image = %request.image,
            "Created cluster job"
        );
        Ok(())
    }

    async fn observe(&self, namespace: &str) -> Result<Arc<dyn JobObserver>> {
        let mut watches = self.watches.lock().await;
        if let Some(watch) = watches.get(namespace) {
            return Ok(watch.clone());
        }
        let watch = Arc::new(ClusterWatch::start(self.client.clone(), namespace).await?);
        watches.insert(namespace.to_string(), watch.clone());
        Ok(watch)
    }

    async fn collect_logs(&self, namespace: &str, label: &JobLabel) -> Result<String> {
        let api = self.api::<Pod>(namespace);
        let pods = api
            .list(&ListParams::default().labels(&label.selector()))
            .await
            .map_err(|e| cluster_err(format!("list pods of {}", label.job_name), e))?;

        let mut output = String::new();
        for pod in pods.items {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            let logs = api
                .logs(&name, &LogParams::default())
                .await
                .map_err(|e| cluster_err(format!("logs of pod {}", name), e))?;
            output.push_str(&logs);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::job::ResourceSpec;

    fn request() -> ClusterJobRequest {
        ClusterJobRequest {
            name: "release-7-build".to_string(),
            namespace: "shipyard".to_string(),
            cluster_id: "local".to_string(),
            image: "ghcr.io/acme/builder:2".to_string(),
            label: JobLabel::new("freestyle", "release-7-build"),
            resources: ResourceSpec::new(4000, 8192),
            registries: vec![RegistryNamespace {
                reg_addr: "https://ghcr.io".to_string(),
                namespace: "acme".to_string(),
                ..Default::default()
            }],
            docker_host: "tcp://dind-0.dind.shipyard:2375".to_string(),
        }
    }

    #[test]
    fn test_job_manifest_shape() {
        let job = build_job_manifest(&request()).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        let spec = &value["spec"];
        let pod = &spec["template"]["spec"];
        let container = &pod["containers"][0];

        assert_eq!(spec["backoffLimit"], 0);
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(container["image"], "ghcr.io/acme/builder:2");
        assert_eq!(container["resources"]["limits"]["cpu"], "4000m");
        assert_eq!(container["resources"]["limits"]["memory"], "8192Mi");
        assert_eq!(container["volumeMounts"][0]["mountPath"], CONTEXT_MOUNT_PATH);
        assert_eq!(pod["volumes"][0]["configMap"]["name"], "release-7-build");
        assert_eq!(pod["imagePullSecrets"][0]["name"], "shipyard-registry-ghcr-io-acme");
        assert_eq!(
            spec["template"]["metadata"]["labels"]["s-job-name"],
            "release-7-build"
        );

        let env = container["env"].as_array().unwrap();
        assert!(env.iter().any(|e| e["name"] == "DOCKER_HOST"
            && e["value"] == "tcp://dind-0.dind.shipyard:2375"));
        assert!(env.iter().any(|e| e["name"] == "JOB_CONTEXT_FILE"
            && e["value"] == "/shipyard/context/job-context"));
    }

    #[test]
    fn test_context_config_map_is_labelled() {
        let label = JobLabel::new("freestyle", "release-7-build");
        let cm = build_context_config_map("shipyard", "release-7-build", &label, "{}");
        assert!(label.matches(cm.metadata.labels.as_ref().unwrap()));
        assert_eq!(cm.data.unwrap()[CONTEXT_KEY], "{}");
    }

    #[test]
    fn test_registry_secret() {
        let registry = RegistryNamespace {
            reg_addr: "https://Registry.Example.com:5000/".to_string(),
            access_key: "robot".to_string(),
            secret_key: "hunter2".to_string(),
            ..Default::default()
        };
        let secret = build_registry_secret("shipyard", &registry).unwrap();
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("shipyard-registry-registry-example-com-5000")
        );
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));

        let data = &secret.string_data.unwrap()[DOCKER_CONFIG_KEY];
        let config: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(config["auths"]["Registry.Example.com:5000"]["username"], "robot");
    }

    #[tokio::test]
    #[ignore = "requires a Kubernetes cluster"]
    async fn test_create_and_clean_up_resources() {
        let client = Client::try_default().await.unwrap();
        let backend = KubeBackend::new("local", client);
        let request = request();

        backend
            .create_context_config_map("default", &request.name, &request.label, "{}")
            .await
            .unwrap();
        backend
            .ensure_delete_config_maps("default", &request.label)
            .await
            .unwrap();
        backend.ensure_delete_jobs("default", &request.label).await.unwrap();
    }
}
