//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tether_common::{Error, Result};

use crate::retry::RetryConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a delta sync query may take before it counts as failed.
    pub query_timeout: Duration,
    /// How long a conflict resolver may take before it counts as failed.
    pub resolver_timeout: Duration,
    /// Resolver invocations allowed per mutation.
    pub max_conflict_retries: u32,
    /// Backoff applied to failed delta sync runs.
    pub backoff: RetryConfig,
    /// Connectivity level assumed before the first report.
    pub initially_online: bool,
    /// Lifecycle level assumed before the first report.
    pub initially_foreground: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            resolver_timeout: Duration::from_secs(60),
            max_conflict_retries: 1,
            backoff: RetryConfig::default(),
            initially_online: true,
            initially_foreground: true,
        }
    }
}

impl SyncConfig {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
