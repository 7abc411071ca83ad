//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the orchestrator,
//! the command runner and the HTTP API.

mod error;
mod yaml;

pub use error::ConfigError;
pub use yaml::{
    ApiSettings, CommandConfig, Config, DEFAULT_CONFIG_FILE, OrchestratorConfig, StorageConfig,
};
