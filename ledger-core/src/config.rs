//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Ingestion configuration
    pub ingestion: IngestionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "gateway-ledger".to_string(),
            rocksdb: RocksDBConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 128,      // 128 MB
            max_write_buffer_number: 4,
            target_file_size_mb: 128,       // 128 MB
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Ledger actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Check that identifiers hash their payloads when payloads are supplied
    pub verify_payload_hashes: bool,

    /// Hex prefix marking virtual substate identifiers (none: no virtual substates)
    pub virtual_substate_prefix: Option<String>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            verify_payload_hashes: true,
            virtual_substate_prefix: None,
        }
    }
}

impl IngestionConfig {
    /// Decoded virtual substate prefix
    pub fn virtual_prefix_bytes(&self) -> crate::Result<Option<Vec<u8>>> {
        self.virtual_substate_prefix
            .as_deref()
            .map(|prefix| {
                hex::decode(prefix).map_err(|e| {
                    crate::Error::Config(format!("Invalid virtual substate prefix: {}", e))
                })
            })
            .transpose()
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(prefix) = std::env::var("LEDGER_VIRTUAL_SUBSTATE_PREFIX") {
            config.ingestion.virtual_substate_prefix = Some(prefix);
        }

        if let Ok(verify) = std::env::var("LEDGER_VERIFY_PAYLOAD_HASHES") {
            config.ingestion.verify_payload_hashes = verify
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_VERIFY_PAYLOAD_HASHES: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "gateway-ledger");
        assert!(config.ingestion.verify_payload_hashes);
        assert_eq!(config.ingestion.virtual_prefix_bytes().unwrap(), None);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/ledger"

            [ingestion]
            virtual_substate_prefix = "ff00"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.rocksdb.max_background_jobs, 4);
        assert_eq!(
            config.ingestion.virtual_prefix_bytes().unwrap(),
            Some(vec![0xff, 0x00])
        );
    }

    #[test]
    fn test_invalid_virtual_prefix() {
        let ingestion = IngestionConfig {
            virtual_substate_prefix: Some("zz".to_string()),
            ..IngestionConfig::default()
        };
        assert!(ingestion.virtual_prefix_bytes().is_err());
    }
}
