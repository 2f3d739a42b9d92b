//! Configuration for the credit ledger service

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Emit JSON log lines instead of human readable ones
    pub log_json: bool,

    /// RocksDB configuration
    pub storage: StorageConfig,

    /// Gas accounting
    pub gas: GasConfig,

    /// Request actor
    pub actor: ActorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/credit-ledger"),
            service_name: "credit-ledger".to_string(),
            log_json: false,
            storage: StorageConfig::default(),
            gas: GasConfig::default(),
            actor: ActorConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Gas accounting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Gas charged per processed item
    pub cost_per_item: u64,

    /// Gas available to one request
    pub request_limit: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            cost_per_item: crate::ledger::DEFAULT_GAS_COST_PER_ITEM,
            request_limit: 1_000_000,
        }
    }
}

/// Request actor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Pending requests before senders wait
    pub mailbox_capacity: usize,

    /// Committed events buffered for slow subscribers
    pub event_channel_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            event_channel_capacity: 4096,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables (`CREDIT_LEDGER_*`)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(data_dir) = lookup("CREDIT_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(service_name) = lookup("CREDIT_LEDGER_SERVICE_NAME") {
            config.service_name = service_name;
        }
        if let Some(log_json) = lookup("CREDIT_LEDGER_LOG_JSON") {
            config.log_json = parse_var("CREDIT_LEDGER_LOG_JSON", &log_json)?;
        }
        if let Some(cost) = lookup("CREDIT_LEDGER_GAS_COST_PER_ITEM") {
            config.gas.cost_per_item = parse_var("CREDIT_LEDGER_GAS_COST_PER_ITEM", &cost)?;
        }
        if let Some(limit) = lookup("CREDIT_LEDGER_GAS_REQUEST_LIMIT") {
            config.gas.request_limit = parse_var("CREDIT_LEDGER_GAS_REQUEST_LIMIT", &limit)?;
        }
        if let Some(capacity) = lookup("CREDIT_LEDGER_MAILBOX_CAPACITY") {
            config.actor.mailbox_capacity = parse_var("CREDIT_LEDGER_MAILBOX_CAPACITY", &capacity)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.actor.mailbox_capacity == 0 {
            return Err(Error::Config("actor.mailbox_capacity must be positive".to_string()));
        }
        if self.actor.event_channel_capacity == 0 {
            return Err(Error::Config("actor.event_channel_capacity must be positive".to_string()));
        }
        if self.gas.request_limit < self.gas.cost_per_item {
            return Err(Error::Config(format!(
                "gas.request_limit {} cannot pay for a single item at {}",
                self.gas.request_limit, self.gas.cost_per_item
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {}={:?}: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.gas.cost_per_item, 10);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CREDIT_LEDGER_DATA_DIR", "/var/lib/credits"),
            ("CREDIT_LEDGER_LOG_JSON", "true"),
            ("CREDIT_LEDGER_GAS_COST_PER_ITEM", "25"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/credits"));
        assert!(config.log_json);
        assert_eq!(config.gas.cost_per_item, 25);
        assert_eq!(config.actor, ActorConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = Config::from_lookup(|key| (key == "CREDIT_LEDGER_MAILBOX_CAPACITY").then(|| "lots".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = Config::from_lookup(|key| (key == "CREDIT_LEDGER_MAILBOX_CAPACITY").then(|| "0".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(
            &path,
            r#"
service_name = "credits-test"

[gas]
cost_per_item = 5

[storage]
enable_statistics = true
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.service_name, "credits-test");
        assert_eq!(config.gas.cost_per_item, 5);
        assert_eq!(config.gas.request_limit, GasConfig::default().request_limit);
        assert!(config.storage.enable_statistics);
        assert_eq!(config.storage.max_background_jobs, 2);
    }
}
