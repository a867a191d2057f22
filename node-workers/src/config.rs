//! Configuration for the data aggregator

use crate::backoff::DelayBetweenLoops;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Ledger configuration
    pub ledger: gateway_ledger_core::Config,

    /// Network every node must report
    pub network_name: String,

    /// Nodes to ingest from
    pub nodes: Vec<NodeConfig>,

    /// Interval between reconciliation passes (milliseconds)
    pub reconcile_interval_ms: u64,

    /// How long a node that failed to start is left alone (seconds)
    pub startup_blocklist_secs: u64,

    /// Transaction fetch worker settings
    pub fetch: FetchConfig,

    /// Quorum confirmation settings
    pub confirmation: ConfirmationConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ledger: gateway_ledger_core::Config::default(),
            network_name: "mainnet".to_string(),
            nodes: Vec::new(),
            reconcile_interval_ms: 1000,
            startup_blocklist_secs: crate::DEFAULT_STARTUP_BLOCKLIST.as_secs(),
            fetch: FetchConfig::default(),
            confirmation: ConfirmationConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        let config: AggregatorConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::Config(format!("Duplicate node name {}", node.name)));
            }
        }
        self.fetch.delay_between_loops()?;
        self.confirmation.validate()?;
        Ok(())
    }

    /// Nodes currently enabled
    pub fn enabled_nodes(&self) -> Vec<NodeConfig> {
        self.nodes.iter().filter(|n| n.enabled).cloned().collect()
    }

    /// Startup blocklist cool-down
    pub fn startup_blocklist(&self) -> Duration {
        Duration::from_secs(self.startup_blocklist_secs)
    }
}

/// One node to ingest from. A changed entry counts as a different node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name
    pub name: String,

    /// Base URL of the node's core API
    pub core_api_url: String,

    /// Whether to ingest from this node
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Request timeout (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Weight of this node's vote towards the quorum
    #[serde(default = "default_trust_weight")]
    pub trust_weight: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    crate::DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_trust_weight() -> u32 {
    1
}

/// Transaction fetch worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Maximum transactions per fetch
    pub max_batch_size: usize,

    /// Target loop period after a successful fetch (milliseconds)
    pub success_interval_ms: u64,

    /// Delay after an error (milliseconds)
    pub base_error_delay_ms: u64,

    /// Consecutive errors tolerated before backing off
    pub errors_before_backoff: u32,

    /// Backoff multiplier
    pub backoff_rate: f64,

    /// Maximum delay after an error (milliseconds)
    pub max_error_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            success_interval_ms: 200,
            base_error_delay_ms: 1000,
            errors_before_backoff: 1,
            backoff_rate: 2.0,
            max_error_delay_ms: 30_000,
        }
    }
}

impl FetchConfig {
    /// Backoff policy for the fetch loop
    pub fn delay_between_loops(&self) -> Result<DelayBetweenLoops> {
        DelayBetweenLoops::exponential(
            Duration::from_millis(self.success_interval_ms),
            Duration::from_millis(self.base_error_delay_ms),
            self.errors_before_backoff,
            self.backoff_rate,
            Duration::from_millis(self.max_error_delay_ms),
        )
    }
}

/// Quorum confirmation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Share of trust weight that must agree on a transaction before it is committed
    pub quorum_requires_trust_proportion: f64,

    /// Count only sufficiently synced nodes towards the quorum requirement
    pub only_use_sufficiently_synced_up_nodes_for_quorum_calculation: bool,

    /// How far behind the top of ledger a node may be and still count as synced
    pub sufficiently_synced_state_version_threshold: u64,

    /// Maximum transactions per committed extension
    pub max_commit_batch_size: u64,

    /// Maximum transactions held per node ahead of the top of ledger
    pub max_transaction_pipeline_size_per_node: u64,

    /// Target period of the ledger extension loop (milliseconds)
    pub commit_interval_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            quorum_requires_trust_proportion: 0.51,
            only_use_sufficiently_synced_up_nodes_for_quorum_calculation: false,
            sufficiently_synced_state_version_threshold: 1000,
            max_commit_batch_size: 1000,
            max_transaction_pipeline_size_per_node: 3000,
            commit_interval_ms: 200,
        }
    }
}

impl ConfirmationConfig {
    /// Reject proportions outside `(0, 1]` and empty batches
    pub fn validate(&self) -> Result<()> {
        let proportion = self.quorum_requires_trust_proportion;
        if !(proportion > 0.0 && proportion <= 1.0) {
            return Err(Error::Config(format!(
                "quorum_requires_trust_proportion must be in (0, 1], got {}",
                proportion
            )));
        }
        if self.max_commit_batch_size == 0 || self.max_transaction_pipeline_size_per_node == 0 {
            return Err(Error::Config(
                "commit batch and pipeline sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff policy for the ledger extension loop
    pub fn delay_between_loops(&self) -> Result<DelayBetweenLoops> {
        DelayBetweenLoops::exponential(
            Duration::from_millis(self.commit_interval_ms),
            Duration::from_secs(1),
            1,
            2.0,
            Duration::from_secs(30),
        )
    }
}
