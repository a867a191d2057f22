//! Prometheus metrics for quorum confirmation
//!
//! # Metrics
//!
//! - `ledger_sync_quorum_exists_status` - Whether enough nodes agree to keep committing
//! - `ledger_sync_quorum_extension_consistent_status` - Whether the quorum's extension was accepted
//! - `ledger_sync_sufficiently_synced_up_nodes_total` - Nodes close enough to the top of ledger
//! - `ledger_sync_sufficiently_synced_up_nodes_trust_weighting_total` - Their trust weight
//! - `ledger_sync_configured_nodes_total` - Nodes configured for ingestion
//! - `ledger_sync_configured_nodes_trust_weighting_total` - Their trust weight
//! - `ledger_sync_trust_weighting_required_for_quorum_total` - Weight needed now
//! - `ledger_sync_trust_weighting_required_for_quorum_if_all_nodes_sufficiently_synced_total`
//! - `node_ledger_tip_state_version{node}` - Highest state version seen from the node
//! - `node_ledger_tip_is_consistent_with_quorum_status{node}` - Node agrees with the quorum
//!
//! Status gauges read 1 for yes, 0.5 for unknown and 0 for no.

use prometheus::{Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;

/// Tri-state status as exported on gauges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStatus {
    /// Known bad
    No,
    /// Not enough information
    Unknown,
    /// Known good
    Yes,
}

impl MetricStatus {
    /// Gauge value
    pub fn value(self) -> f64 {
        match self {
            MetricStatus::No => 0.0,
            MetricStatus::Unknown => 0.5,
            MetricStatus::Yes => 1.0,
        }
    }
}

/// Quorum confirmation collectors
#[derive(Clone, Debug)]
pub struct ConfirmationMetrics {
    /// Quorum exists
    pub quorum_exists: Gauge,

    /// Quorum extension accepted by the ledger
    pub quorum_extension_consistent: Gauge,

    /// Sufficiently synced nodes
    pub synced_nodes: IntGauge,

    /// Trust weight of sufficiently synced nodes
    pub synced_nodes_trust: Gauge,

    /// Configured nodes
    pub configured_nodes: IntGauge,

    /// Trust weight of configured nodes
    pub configured_nodes_trust: Gauge,

    /// Trust weight required for quorum now
    pub trust_required: Gauge,

    /// Trust weight required once every node is synced
    pub trust_required_if_all_synced: Gauge,

    /// Per-node tip
    pub node_tip_state_version: IntGaugeVec,

    /// Per-node consistency with the quorum
    pub node_consistent_with_quorum: GaugeVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl ConfirmationMetrics {
    /// Create and register every collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let gauge = |name: &str, help: &str| -> prometheus::Result<Gauge> {
            let gauge = Gauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let int_gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let quorum_exists = gauge(
            "ledger_sync_quorum_exists_status",
            "Whether enough nodes agree to continue committing transactions",
        )?;
        let quorum_extension_consistent = gauge(
            "ledger_sync_quorum_extension_consistent_status",
            "Whether the quorum's ledger extension was accepted by the ledger",
        )?;
        let synced_nodes = int_gauge(
            "ledger_sync_sufficiently_synced_up_nodes_total",
            "Nodes which are sufficiently synced up",
        )?;
        let synced_nodes_trust = gauge(
            "ledger_sync_sufficiently_synced_up_nodes_trust_weighting_total",
            "Trust weighting of nodes which are sufficiently synced up",
        )?;
        let configured_nodes = int_gauge(
            "ledger_sync_configured_nodes_total",
            "Nodes configured for transaction ingestion",
        )?;
        let configured_nodes_trust = gauge(
            "ledger_sync_configured_nodes_trust_weighting_total",
            "Trust weighting of nodes configured for transaction ingestion",
        )?;
        let trust_required = gauge(
            "ledger_sync_trust_weighting_required_for_quorum_total",
            "Trust weighting currently required for quorum",
        )?;
        let trust_required_if_all_synced = gauge(
            "ledger_sync_trust_weighting_required_for_quorum_if_all_nodes_sufficiently_synced_total",
            "Trust weighting required for quorum once all nodes are sufficiently synced",
        )?;

        let node_tip_state_version = IntGaugeVec::new(
            Opts::new(
                "node_ledger_tip_state_version",
                "Highest state version seen from the node",
            ),
            &["node"],
        )?;
        registry.register(Box::new(node_tip_state_version.clone()))?;

        let node_consistent_with_quorum = GaugeVec::new(
            Opts::new(
                "node_ledger_tip_is_consistent_with_quorum_status",
                "Whether the node's ledger agrees with the committed quorum",
            ),
            &["node"],
        )?;
        registry.register(Box::new(node_consistent_with_quorum.clone()))?;

        quorum_exists.set(MetricStatus::Unknown.value());
        quorum_extension_consistent.set(MetricStatus::Unknown.value());

        Ok(Self {
            quorum_exists,
            quorum_extension_consistent,
            synced_nodes,
            synced_nodes_trust,
            configured_nodes,
            configured_nodes_trust,
            trust_required,
            trust_required_if_all_synced,
            node_tip_state_version,
            node_consistent_with_quorum,
            registry,
        })
    }
}
