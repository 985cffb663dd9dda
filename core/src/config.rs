use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on blob transfers running at once
    pub max_concurrent_blobs: usize,

    /// Read size when digesting or streaming local content
    pub chunk_size: usize,

    /// Longest wait for the next chunk of a blob in seconds (0 = unlimited).
    /// Resets on every chunk, so slow but steady transfers never trip it.
    pub blob_idle_timeout_secs: u64,

    /// Whole-replication deadline in seconds (0 = unlimited)
    pub timeout_secs: u64,

    /// Registry connect deadline in seconds (0 = unlimited)
    pub connect_timeout_secs: u64,

    /// Scheme used to reach registries
    pub protocol: RegistryProtocol,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_blobs: 4,
            chunk_size: 64 * 1024,
            blob_idle_timeout_secs: 120,
            timeout_secs: 0,
            connect_timeout_secs: 30,
            protocol: RegistryProtocol::Https,
        }
    }
}

impl RelayConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RelayError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&data)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_blobs == 0 {
            return Err(RelayError::ConfigError(
                "max_concurrent_blobs must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(RelayError::ConfigError(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn blob_idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.blob_idle_timeout_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        non_zero_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.connect_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// How registries are addressed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryProtocol {
    /// Plain HTTP everywhere (local test registries)
    Http,
    /// HTTPS everywhere
    #[default]
    Https,
    /// HTTPS except for the listed hosts, which use HTTP
    HttpsExcept(Vec<String>),
}

impl RegistryProtocol {
    /// URL scheme to use for `registry`.
    pub fn scheme_for(&self, registry: &str) -> &'static str {
        match self {
            RegistryProtocol::Http => "http",
            RegistryProtocol::Https => "https",
            RegistryProtocol::HttpsExcept(hosts) => {
                if hosts.iter().any(|h| h.eq_ignore_ascii_case(registry)) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}
