//! Architecture configuration
//!
//! One YAML file describes the broker topology a worker participates in:
//! exchanges, queues with their bindings, the downstream partition count,
//! and the TCP port the worker's manager listener answers on.

use std::error::Error;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read architecture file: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse architecture file: {}", e),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(rename = "type", default = "default_exchange_type")]
    pub kind: String,
}

fn default_exchange_type() -> String {
    "direct".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingConfig {
    pub exchange: String,
    #[serde(rename = "routingKey")]
    pub routing_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Port the manager listener binds, as a string so it can drop straight
    /// into an address.
    pub port: String,
}

/// The parsed architecture file.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    pub partitions: u32,
    pub worker: WorkerConfig,
}

impl ArchitectureConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(ConfigError::Parse)
    }
}
