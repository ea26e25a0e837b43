//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// System-wide configuration of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Namespace the platform runs in; jobs on the local cluster go here.
    pub namespace: String,
    /// Namespace used on attached clusters.
    pub agent_namespace: String,
    /// Hub server proxying API access to attached clusters.
    pub hub_server: String,
    /// Registry holding the `build-base` executor images.
    pub base_image_registry: String,
    pub log_level: String,
    /// Interval between watch-cache or record polls while waiting.
    pub poll_interval_ms: u64,
    /// How long a finished cluster job may go without a sentinel before it
    /// is considered failed.
    pub sentinel_grace_secs: u64,
    pub database_url: Option<String>,
    /// Docker daemon sidecars per cluster id.
    pub docker_hosts: BTreeMap<String, Vec<String>>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            namespace: "shipyard".to_string(),
            agent_namespace: "shipyard-agent".to_string(),
            hub_server: "http://hub-server:26000".to_string(),
            base_image_registry: "registry.shipyard.local/shipyard".to_string(),
            log_level: "info".to_string(),
            poll_interval_ms: 1000,
            sentinel_grace_secs: 10,
            database_url: None,
            docker_hosts: BTreeMap::new(),
        }
    }
}

/// Parse system configuration from KDL text. Unset fields keep their
/// defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "namespace" => config.namespace = required_string(node)?,
            "agent-namespace" => config.agent_namespace = required_string(node)?,
            "hub-server" => config.hub_server = required_string(node)?,
            "base-image-registry" => config.base_image_registry = required_string(node)?,
            "log-level" => config.log_level = required_string(node)?,
            "database-url" => config.database_url = Some(required_string(node)?),
            "poll-interval-ms" => config.poll_interval_ms = positive_integer(node)?,
            "sentinel-grace-secs" => config.sentinel_grace_secs = non_negative_integer(node)?,
            "docker-hosts" => config.docker_hosts = parse_docker_hosts(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.namespace == config.agent_namespace {
        return Err(ConfigError::InvalidValue {
            field: "agent-namespace".to_string(),
            message: "must differ from namespace".to_string(),
        });
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn parse_docker_hosts(node: &KdlNode) -> ConfigResult<BTreeMap<String, Vec<String>>> {
    let mut hosts = BTreeMap::new();
    let Some(children) = node.children() else {
        return Ok(hosts);
    };

    for cluster in children.nodes() {
        if cluster.name().value() != "cluster" {
            continue;
        }
        let cluster_id = get_first_string_arg(cluster)
            .ok_or_else(|| ConfigError::MissingField("docker-hosts cluster id".to_string()))?;

        let mut addrs = Vec::new();
        if let Some(entries) = cluster.children() {
            for host in entries.nodes() {
                if host.name().value() == "host" {
                    addrs.push(required_string(host)?);
                }
            }
        }

        if hosts.insert(cluster_id.clone(), addrs).is_some() {
            return Err(ConfigError::Duplicate(format!(
                "docker-hosts cluster '{}'",
                cluster_id
            )));
        }
    }

    Ok(hosts)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn required_string(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

fn non_negative_integer(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value();
    let value = get_first_integer_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected a non-negative integer, got {}", value),
    })
}

fn positive_integer(node: &KdlNode) -> ConfigResult<u64> {
    match non_negative_integer(node)? {
        0 => Err(ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "must be greater than zero".to_string(),
        }),
        value => Ok(value),
    }
}
