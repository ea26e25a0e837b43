//! KDL configuration parsing for Shipyard.
//!
//! This crate handles:
//! - System configuration (shipyard.kdl)
//! - Detection of unresolved job placeholders in env values

pub mod error;
pub mod placeholders;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{SystemConfig, load_system_config, parse_system_config};
