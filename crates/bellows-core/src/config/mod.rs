mod database;
mod observability;

pub use database::DatabaseConfig;
pub use observability::{LogFormat, ObservabilityConfig};

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BellowsError, Result};

/// Root configuration for the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BellowsConfig {
    /// Controller identity and URLs.
    pub controller: ControllerConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Loop intervals.
    #[serde(default)]
    pub intervals: IntervalsConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BellowsConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BellowsError::Config(format!("failed to read config file: {}", e)))?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);
        toml::from_str(&content)
            .map_err(|e| BellowsError::Config(format!("failed to parse config: {}", e)))
    }
}

/// Controller identity and the URLs handed to booting runners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Stable controller ID; stamped into runner labels so consolidation
    /// can tell this controller's runners apart from anyone else's.
    pub id: Uuid,

    /// URL booting runners report status to.
    pub callback_url: String,

    /// URL booting runners fetch instance metadata from.
    pub metadata_url: String,

    /// Prefix for generated runner names.
    #[serde(default = "default_runner_prefix")]
    pub runner_prefix: String,
}

fn default_runner_prefix() -> String {
    "bellows".to_string()
}

/// Loop intervals, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    /// Reconciliation timer per scale set worker.
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,

    /// Global consolidation pass.
    #[serde(default = "default_consolidation_secs")]
    pub consolidation_secs: u64,
}

impl IntervalsConfig {
    pub fn reconcile(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs)
    }

    pub fn consolidation(&self) -> Duration {
        Duration::from_secs(self.consolidation_secs)
    }
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            reconcile_secs: default_reconcile_secs(),
            consolidation_secs: default_consolidation_secs(),
        }
    }
}

fn default_reconcile_secs() -> u64 {
    60
}

fn default_consolidation_secs() -> u64 {
    300
}

/// Substitute `${VAR}` references with environment variable values.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
