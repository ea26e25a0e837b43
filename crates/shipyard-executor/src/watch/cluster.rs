//! Cached watch over the managed Jobs, Pods and ConfigMaps of a namespace.

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use serde::de::DeserializeOwned;
use shipyard_core::cluster::{
    ClusterJobState, JobObserver, LABEL_JOB_NAME, LABEL_MANAGED_BY, MANAGED_BY, OUTPUTS_KEY,
    OutputValue, SENTINEL_KEY,
};
use shipyard_core::job::JobStatus;
use shipyard_core::{Error, Result};
use std::fmt::Debug;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::WaitSettings;

const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ClusterWatch {
    jobs: Store<Job>,
    pods: Store<Pod>,
    config_maps: Store<ConfigMap>,
    tasks: Vec<JoinHandle<()>>,
}

fn spawn_reflector<K>(api: Api<K>, selector: &str) -> (Store<K>, JoinHandle<()>)
where
    K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let mut stream = watcher(api, watcher::Config::default().labels(selector))
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .boxed();
    let handle = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                warn!(error = %e, "Watch error");
            }
        }
    });
    (reader, handle)
}

impl ClusterWatch {
    /// Start watching `namespace` and wait for the initial listing.
    pub async fn start(client: Client, namespace: &str) -> Result<Self> {
        let selector = format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY);
        let (jobs, jobs_task) = spawn_reflector(Api::namespaced(client.clone(), namespace), &selector);
        let (pods, pods_task) = spawn_reflector(Api::namespaced(client.clone(), namespace), &selector);
        let (config_maps, cms_task) = spawn_reflector(Api::namespaced(client, namespace), &selector);
        let watch = Self {
            jobs,
            pods,
            config_maps,
            tasks: vec![jobs_task, pods_task, cms_task],
        };

        let synced = tokio::time::timeout(SYNC_TIMEOUT, async {
            watch.jobs.wait_until_ready().await.is_ok()
                && watch.pods.wait_until_ready().await.is_ok()
                && watch.config_maps.wait_until_ready().await.is_ok()
        })
        .await;
        match synced {
            Ok(true) => {
                debug!(namespace, "Watch cache synced");
                Ok(watch)
            }
            Ok(false) => Err(Error::Cluster(format!("watch on {} stopped before syncing", namespace))),
            Err(_) => Err(Error::Cluster(format!("watch on {} did not sync in time", namespace))),
        }
    }

    fn config_map(&self, namespace: &str, name: &str) -> Option<std::sync::Arc<ConfigMap>> {
        self.config_maps.get(&ObjectRef::new(name).within(namespace))
    }

    fn pod_started(&self, namespace: &str, job_name: &str) -> bool {
        self.pods.state().iter().any(|pod| {
            let in_job = pod.metadata.namespace.as_deref() == Some(namespace)
                && pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_JOB_NAME))
                    .is_some_and(|n| n == job_name);
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            in_job && matches!(phase, Some("Running" | "Succeeded" | "Failed"))
        })
    }
}

impl Drop for ClusterWatch {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl JobObserver for ClusterWatch {
    fn job_state(&self, namespace: &str, name: &str) -> ClusterJobState {
        let Some(job) = self.jobs.get(&ObjectRef::new(name).within(namespace)) else {
            return ClusterJobState::Missing;
        };
        let Some(status) = job.status.as_ref() else {
            return ClusterJobState::Pending;
        };

        if status.succeeded.unwrap_or(0) > 0 {
            return ClusterJobState::Succeeded;
        }
        let failed = status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "Failed" && c.status == "True");
        if let Some(condition) = failed {
            let message = condition
                .message
                .clone()
                .or_else(|| condition.reason.clone())
                .unwrap_or_else(|| "job failed".to_string());
            return ClusterJobState::Failed { message };
        }
        if status.failed.unwrap_or(0) > 0 {
            return ClusterJobState::Failed {
                message: "executor pod failed".to_string(),
            };
        }
        if self.pod_started(namespace, name) {
            ClusterJobState::Running
        } else {
            ClusterJobState::Pending
        }
    }

    fn sentinel(&self, namespace: &str, config_map: &str) -> Option<JobStatus> {
        let cm = self.config_map(namespace, config_map)?;
        let value = cm.data.as_ref()?.get(SENTINEL_KEY)?;
        value
            .trim()
            .parse::<JobStatus>()
            .ok()
            .filter(|s| s.is_terminal())
    }

    fn outputs(&self, namespace: &str, config_map: &str) -> Result<Vec<OutputValue>> {
        let cm = self
            .config_map(namespace, config_map)
            .ok_or_else(|| Error::NotFound(format!("configmap {}/{}", namespace, config_map)))?;
        let Some(raw) = cm.data.as_ref().and_then(|d| d.get(OUTPUTS_KEY)) else {
            return Ok(Vec::new());
        };
        serde_json::from_str(raw)
            .map_err(|e| Error::Completion(format!("invalid outputs in {}: {}", config_map, e)))
    }
}

/// Wait until the job's compute has started. A job that already finished
/// (or reported) counts as started.
pub async fn wait_job_start(
    observer: &dyn JobObserver,
    namespace: &str,
    name: &str,
    deadline: Instant,
    settings: WaitSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        if observer.job_state(namespace, name).has_started()
            || observer.sentinel(namespace, name).is_some()
        {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(Error::Timeout(format!("job {} did not start in time", name)));
            }
            _ = sleep(settings.poll_interval) => {}
        }
    }
}

/// Wait for the executor's result.
///
/// The sentinel in the context ConfigMap decides the outcome. When the Job
/// finishes or disappears without one, the sentinel gets
/// `settings.sentinel_grace` to show up before the job is failed.
pub async fn wait_job_end(
    observer: &dyn JobObserver,
    namespace: &str,
    name: &str,
    config_map: &str,
    deadline: Instant,
    settings: WaitSettings,
    cancel: &CancellationToken,
) -> Result<JobStatus> {
    let mut finished_at: Option<Instant> = None;

    loop {
        if let Some(status) = observer.sentinel(namespace, config_map) {
            return Ok(status);
        }

        let state = observer.job_state(namespace, name);
        if state.is_finished() {
            let since = *finished_at.get_or_insert_with(Instant::now);
            if since.elapsed() >= settings.sentinel_grace {
                let message = match state {
                    ClusterJobState::Missing => {
                        format!("job {} disappeared without reporting a result", name)
                    }
                    ClusterJobState::Failed { message } => {
                        format!("job {} failed without reporting a result: {}", name, message)
                    }
                    _ => format!("job {} exited without reporting a result", name),
                };
                return Err(Error::Cluster(message));
            }
        } else {
            finished_at = None;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(Error::Timeout(format!("job {} did not finish in time", name)));
            }
            _ = sleep(settings.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher::Event;
    use serde_json::json;
    use std::sync::Mutex;

    /// Observer whose answers tests change while a wait is running.
    #[derive(Default)]
    struct FakeObserver {
        pub state: Mutex<Option<ClusterJobState>>,
        pub sentinel: Mutex<Option<JobStatus>>,
    }

    impl FakeObserver {
        pub fn set_state(&self, state: ClusterJobState) {
            *self.state.lock().unwrap() = Some(state);
        }

        pub fn set_sentinel(&self, status: JobStatus) {
            *self.sentinel.lock().unwrap() = Some(status);
        }
    }

    impl JobObserver for FakeObserver {
        fn job_state(&self, _namespace: &str, _name: &str) -> ClusterJobState {
            self.state
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(ClusterJobState::Pending)
        }

        fn sentinel(&self, _namespace: &str, _config_map: &str) -> Option<JobStatus> {
            *self.sentinel.lock().unwrap()
        }

        fn outputs(&self, _namespace: &str, _config_map: &str) -> Result<Vec<OutputValue>> {
            Ok(Vec::new())
        }
    }

    fn settings() -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_millis(100),
            sentinel_grace: Duration::from_secs(10),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_running() {
        let observer = std::sync::Arc::new(FakeObserver::default());
        let cancel = CancellationToken::new();

        let flip = observer.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            flip.set_state(ClusterJobState::Running);
        });

        let started = Instant::now();
        wait_job_start(observer.as_ref(), "ns", "job", far_deadline(), settings(), &cancel)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_at_deadline() {
        let observer = FakeObserver::default();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(30);

        let result = wait_job_start(&observer, "ns", "job", deadline, settings(), &cancel).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_before_resource_finishes() {
        let observer = FakeObserver::default();
        observer.set_state(ClusterJobState::Running);
        observer.set_sentinel(JobStatus::Passed);
        let cancel = CancellationToken::new();

        let status = wait_job_end(&observer, "ns", "job", "job", far_deadline(), settings(), &cancel)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_arrives_within_grace() {
        let observer = std::sync::Arc::new(FakeObserver::default());
        observer.set_state(ClusterJobState::Succeeded);
        let cancel = CancellationToken::new();

        let late = observer.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            late.set_sentinel(JobStatus::Failed);
        });

        let status = wait_job_end(observer.as_ref(), "ns", "job", "job", far_deadline(), settings(), &cancel)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sentinel_fails_after_grace() {
        let observer = FakeObserver::default();
        observer.set_state(ClusterJobState::Missing);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let result = wait_job_end(&observer, "ns", "job", "job", far_deadline(), settings(), &cancel).await;
        assert!(matches!(result, Err(Error::Cluster(ref m)) if m.contains("disappeared")));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(result.unwrap_err().job_status(), JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_end_wait() {
        let observer = FakeObserver::default();
        observer.set_state(ClusterJobState::Running);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let result = wait_job_end(&observer, "ns", "job", "job", far_deadline(), settings(), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    fn watch_with(jobs: Vec<Job>, pods: Vec<Pod>, cms: Vec<ConfigMap>) -> ClusterWatch {
        let (job_store, mut job_writer) = reflector::store::<Job>();
        let (pod_store, mut pod_writer) = reflector::store::<Pod>();
        let (cm_store, mut cm_writer) = reflector::store::<ConfigMap>();
        for job in jobs {
            job_writer.apply_watcher_event(&Event::Apply(job));
        }
        for pod in pods {
            pod_writer.apply_watcher_event(&Event::Apply(pod));
        }
        for cm in cms {
            cm_writer.apply_watcher_event(&Event::Apply(cm));
        }
        ClusterWatch {
            jobs: job_store,
            pods: pod_store,
            config_maps: cm_store,
            tasks: Vec::new(),
        }
    }

    fn job(status: serde_json::Value) -> Job {
        serde_json::from_value(json!({
            "metadata": { "name": "build", "namespace": "ns" },
            "status": status,
        }))
        .unwrap()
    }

    fn pod(phase: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": "build-x1",
                "namespace": "ns",
                "labels": { LABEL_JOB_NAME: "build" },
            },
            "status": { "phase": phase },
        }))
        .unwrap()
    }

    fn config_map(data: serde_json::Value) -> ConfigMap {
        serde_json::from_value(json!({
            "metadata": { "name": "build", "namespace": "ns" },
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn test_job_state_from_cache() {
        let watch = watch_with(vec![], vec![], vec![]);
        assert_eq!(watch.job_state("ns", "build"), ClusterJobState::Missing);

        let watch = watch_with(vec![job(json!({ "active": 1 }))], vec![pod("Pending")], vec![]);
        assert_eq!(watch.job_state("ns", "build"), ClusterJobState::Pending);

        let watch = watch_with(vec![job(json!({ "active": 1 }))], vec![pod("Running")], vec![]);
        assert_eq!(watch.job_state("ns", "build"), ClusterJobState::Running);

        let watch = watch_with(vec![job(json!({ "succeeded": 1 }))], vec![], vec![]);
        assert_eq!(watch.job_state("ns", "build"), ClusterJobState::Succeeded);

        let failed = json!({
            "failed": 1,
            "conditions": [{
                "type": "Failed",
                "status": "True",
                "reason": "BackoffLimitExceeded",
                "message": "Job has reached the specified backoff limit",
            }],
        });
        let watch = watch_with(vec![job(failed)], vec![], vec![]);
        assert_eq!(
            watch.job_state("ns", "build"),
            ClusterJobState::Failed {
                message: "Job has reached the specified backoff limit".to_string()
            }
        );
    }

    #[test]
    fn test_sentinel_and_outputs_from_cache() {
        let watch = watch_with(
            vec![],
            vec![],
            vec![config_map(json!({
                SENTINEL_KEY: "passed\n",
                OUTPUTS_KEY: r#"[{"name":"IMAGE","value":"registry/app:1"}]"#,
            }))],
        );
        assert_eq!(watch.sentinel("ns", "build"), Some(JobStatus::Passed));
        assert_eq!(
            watch.outputs("ns", "build").unwrap(),
            vec![OutputValue {
                name: "IMAGE".to_string(),
                value: "registry/app:1".to_string()
            }]
        );
        assert!(matches!(watch.outputs("ns", "other"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_non_terminal_sentinel_is_ignored() {
        let watch = watch_with(vec![], vec![], vec![config_map(json!({ SENTINEL_KEY: "running" }))]);
        assert_eq!(watch.sentinel("ns", "build"), None);
    }
}
