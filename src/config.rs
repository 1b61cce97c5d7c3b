//! Configuration for the runtime, registry and execution engine
//!
//! Every section has defaults, so an empty document is a valid configuration:
//!
//! ```yaml
//! runtime:
//!   mailbox_capacity: 100
//! registry:
//!   liveness_window: 60s
//!   cleanup_interval: 30s
//! engine:
//!   orchestrator_id: orchestrator
//!   retry:
//!     max_attempts: 3
//!     backoff: 1s
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::AgentId;

/// Environment variable naming a configuration file
pub const CONFIG_PATH_ENV: &str = "CONCLAVE_CONFIG_PATH";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConclaveConfig {
    pub runtime: RuntimeConfig,
    pub registry: RegistryConfig,
    pub engine: EngineConfig,
}

impl ConclaveConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Path from `CONCLAVE_CONFIG_PATH`, then `./conclave.yaml`
    pub fn discover() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }
        let local = PathBuf::from("conclave.yaml");
        local.exists().then_some(local)
    }

    /// Discovered configuration, or defaults when no file exists
    pub fn load() -> anyhow::Result<Self> {
        match Self::discover() {
            Some(path) => Self::from_yaml_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Agent runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of each agent inbox
    pub mailbox_capacity: usize,
    /// Buffer of each event bus subscription
    pub bus_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 100,
            bus_buffer: 10,
        }
    }
}

/// Registry liveness settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat age after which an agent is considered offline
    #[serde(with = "humantime_serde")]
    pub liveness_window: Duration,
    /// Period of the cleanup task
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Attempts and linear backoff for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` (0-based) is followed by a pause of `backoff * (n + 1)`
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts, backoff }
    }

    /// Pause after the given failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Execution engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sender id of the engine's calls
    pub orchestrator_id: AgentId,
    pub retry: RetryPolicy,
    /// Bound on concurrently running tasks; unbounded when absent
    pub max_concurrency: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: AgentId::new("orchestrator"),
            retry: RetryPolicy::default(),
            max_concurrency: None,
        }
    }
}
