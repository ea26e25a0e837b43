//! Job backends for Shipyard.
//!
//! - Kubernetes resources of cluster jobs and access to attached clusters
//! - Completion watchers for cluster jobs and remote agent jobs
//! - Docker host selection and executor image resolution

pub mod cluster_access;
pub mod dockerhost;
pub mod registry;
pub mod resources;
pub mod watch;

pub use cluster_access::KubeClusterProvider;
pub use dockerhost::{DockerHosts, route_docker_host};
pub use registry::DefaultImageResolver;
pub use resources::KubeBackend;
pub use watch::WaitSettings;
