//! YAML configuration parsing.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Durations are given in seconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::api::{ApiConfig, DEFAULT_PORT};
use crate::core::retry::RetryPolicy;
use crate::execution::CommandRunner;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "scanward.yaml";

/// Top-level configuration (scanward.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where task records are kept.
    pub storage: StorageConfig,
    /// Maximum concurrent executions.
    pub max_workers: usize,
    /// Scanner invocation.
    pub command: CommandConfig,
    /// Retry, liveness and shutdown settings.
    pub orchestrator: OrchestratorConfig,
    /// HTTP API binding.
    pub api: ApiSettings,
    /// Arguments used when a request carries none.
    pub default_arguments: Vec<String>,
    /// Ceiling for run-and-wait requests, in seconds.
    pub run_wait_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            max_workers: 4,
            command: CommandConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            api: ApiSettings::default(),
            default_arguments: ["-sT", "--top-ports", "100"]
                .into_iter()
                .map(String::from)
                .collect(),
            run_wait_timeout: 600,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Scanner command settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Scanner executable.
    pub program: String,
    /// Ceiling for one attempt, in seconds.
    pub attempt_timeout: u64,
    /// Heartbeat period while the scanner runs, in seconds.
    pub heartbeat_interval: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "nmap".to_string(),
            attempt_timeout: 4 * 60 * 60,
            heartbeat_interval: 10,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Time without a heartbeat before an attempt is lost, in seconds.
    pub heartbeat_timeout: u64,
    /// Total attempts per task, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt, in seconds.
    pub initial_backoff: u64,
    /// Upper bound for a single backoff, in seconds.
    pub max_backoff: u64,
    pub backoff_multiplier: f64,
    /// Graceful shutdown timeout, in seconds.
    pub shutdown_timeout: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: 120,
            max_attempts: 3,
            initial_backoff: 5,
            max_backoff: 60,
            backoff_multiplier: 2.0,
            shutdown_timeout: 30,
        }
    }
}

/// HTTP API binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "orchestrator.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.command.heartbeat_interval == 0 {
            return Err(ConfigError::InvalidConfig(
                "command.heartbeat_interval must be at least 1 second".to_string(),
            ));
        }
        if self.orchestrator.heartbeat_timeout <= self.command.heartbeat_interval {
            return Err(ConfigError::InvalidConfig(format!(
                "orchestrator.heartbeat_timeout ({}s) must exceed command.heartbeat_interval ({}s)",
                self.orchestrator.heartbeat_timeout, self.command.heartbeat_interval
            )));
        }
        let multiplier = self.orchestrator.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "orchestrator.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "command.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The retry policy described by the orchestrator settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        let o = &self.orchestrator;
        RetryPolicy::exponential(
            o.max_attempts,
            Duration::from_secs(o.initial_backoff),
            Duration::from_secs(o.max_backoff),
        )
        .with_multiplier(o.backoff_multiplier)
    }

    /// A command runner for the configured scanner.
    pub fn command_runner(&self) -> CommandRunner {
        CommandRunner::builder(self.command.program.clone())
            .timeout(Duration::from_secs(self.command.attempt_timeout))
            .heartbeat_interval(Duration::from_secs(self.command.heartbeat_interval))
            .build()
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig::new(self.api.host.clone(), self.api.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.heartbeat_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.shutdown_timeout)
    }

    pub fn run_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.run_wait_timeout)
    }
}
