//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use shipyard_config::{SystemConfig, load_system_config};
use std::path::Path;

pub fn load_config(path: &Path) -> Result<SystemConfig> {
    load_system_config(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

pub fn validate(config: &SystemConfig) {
    println!("Configuration is valid");
    println!("  namespace:       {}", config.namespace);
    println!("  agent namespace: {}", config.agent_namespace);
    println!("  hub server:      {}", config.hub_server);
    for (cluster, hosts) in &config.docker_hosts {
        println!("  docker hosts of {}: {}", cluster, hosts.len());
    }
}
