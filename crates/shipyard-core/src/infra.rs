//! Image, registry and docker host resolution.

use crate::job::RegistryNamespace;

/// Resolves the executor image of a job and the registries it pulls from.
pub trait ImageResolver: Send + Sync {
    /// Concrete image for a declared build OS and image source.
    fn base_image(&self, build_os: &str, image_from: &str) -> String;

    /// Subset of `registries` an image is pulled from.
    fn matched_registries(
        &self,
        image: &str,
        registries: &[RegistryNamespace],
    ) -> Vec<RegistryNamespace>;
}

/// Picks the docker daemon sidecar a job's build steps talk to.
pub trait DockerHostSelector: Send + Sync {
    /// Docker host address for a job of run `run_key` in `cluster_id`.
    fn best_host(&self, cluster_id: &str, run_key: &str) -> String;

    /// Forget the assignments of a finished run.
    fn release_run(&self, _run_key: &str) {}
}
