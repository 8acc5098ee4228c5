//! Configuration Module
//!
//! Provides TOML-based configuration for the beacon dissector.
//! Configuration is optional - CLI arguments can override file settings.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dissector::DissectorSettings;
use crate::export::OutputFormat;
use crate::query::DEFAULT_MIN_CONNECTIONS;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub dissector: DissectorConfig,
    pub store: StoreConfig,
    pub output: OutputConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        self.dissector
            .to_settings()
            .validate()
            .map_err(anyhow::Error::msg)?;
        if self.store.collection.is_empty() {
            anyhow::bail!("store.collection must not be empty");
        }
        Ok(())
    }
}

/// Dissection stage tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DissectorConfig {
    /// Connection count above which a source is reported as a strobe
    pub strobe_limit: i64,
    /// Sources with this many connections or fewer are dropped in the query
    pub min_connections: i64,
    /// Number of worker threads, each with its own store session
    pub worker_count: usize,
    /// Retries after a failed store query before the unit is abandoned
    pub query_retries: u32,
    /// Initial retry delay in milliseconds (doubles per retry)
    pub retry_backoff_ms: u64,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        Self {
            strobe_limit: 86_400,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            worker_count: 4,
            query_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

impl DissectorConfig {
    pub fn to_settings(&self) -> DissectorSettings {
        DissectorSettings {
            strobe_limit: self.strobe_limit,
            min_connections: self.min_connections,
            worker_count: self.worker_count,
            query_retries: self.query_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Connection-graph store location
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database
    pub path: PathBuf,
    /// Table holding unique connections
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("beacon.db"),
            collection: "uconn".to_string(),
        }
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format (text, json, jsonl)
    #[serde(with = "output_format_serde")]
    pub format: OutputFormat,
    /// Output file path (None = stdout)
    pub file: Option<String>,
    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::JsonLines,
            file: None,
            verbose: false,
        }
    }
}

/// Prometheus endpoint configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address to serve `/metrics` on (None = disabled)
    pub bind_address: Option<SocketAddr>,
}

/// Custom serde implementation for OutputFormat
mod output_format_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(format: &OutputFormat, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
