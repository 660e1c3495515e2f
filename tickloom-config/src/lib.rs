//! Cluster topology configuration
//!
//! Loads the YAML process map a cluster is launched from and answers
//! "where does this process live" lookups. The runtime consumes this as an
//! in-memory mapping only; file layout and validation end here.
//!
//! ```yaml
//! processConfigs:
//!   - processId: "athens"
//!     ip: "127.0.0.1"
//!     port: 9001
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML did not parse into the expected shape.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The parsed configuration is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// One process entry: a name and the address it listens on.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    /// Process name, unique within the cluster.
    pub process_id: String,
    /// IPv4 address the process binds.
    pub ip: String,
    /// TCP port the process binds.
    pub port: u16,
}

impl ProcessConfig {
    /// The socket address this entry describes.
    pub fn address(&self) -> ConfigResult<SocketAddr> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad ip for {}: {}", self.process_id, self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// The whole cluster map.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// All processes in the cluster.
    pub process_configs: Vec<ProcessConfig>,
}

impl ClusterConfig {
    /// Load and validate a topology file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate topology YAML.
    pub fn from_yaml(content: &str) -> ConfigResult<Self> {
        let config: ClusterConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.process_configs.is_empty() {
            return Err(ConfigError::Invalid("no processes configured".to_string()));
        }
        let mut seen = HashSet::new();
        for entry in &self.process_configs {
            if entry.process_id.is_empty() {
                return Err(ConfigError::Invalid("empty process id".to_string()));
            }
            if !seen.insert(entry.process_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate process id {}",
                    entry.process_id
                )));
            }
            entry.address()?;
        }
        Ok(())
    }

    /// The names of every configured process, in file order.
    pub fn process_ids(&self) -> Vec<&str> {
        self.process_configs
            .iter()
            .map(|entry| entry.process_id.as_str())
            .collect()
    }

    /// The address of one process, if configured.
    pub fn lookup(&self, process_id: &str) -> Option<ConfigResult<SocketAddr>> {
        self.process_configs
            .iter()
            .find(|entry| entry.process_id == process_id)
            .map(ProcessConfig::address)
    }

    /// True when `process_id` appears in the map.
    pub fn contains(&self, process_id: &str) -> bool {
        self.process_configs
            .iter()
            .any(|entry| entry.process_id == process_id)
    }
}
