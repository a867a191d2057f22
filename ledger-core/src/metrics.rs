//! Prometheus metrics for the ingestion pipeline
//!
//! # Metrics
//!
//! - `ledger_transactions_committed_total` - Transactions appended to the ledger
//! - `ledger_batches_committed_total` - Batches committed
//! - `ledger_batches_rejected_total` - Batches rejected as invalid
//! - `ledger_batch_size` - Histogram of committed batch sizes
//! - `ledger_commit_duration_seconds` - Histogram of batch commit latencies
//! - `ledger_top_state_version` - State version at the top of the ledger
//!
//! Collectors are registered on a per-instance [`Registry`], so several
//! ledgers (and tests) can coexist in one process.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Transactions appended
    pub transactions_committed: IntCounter,

    /// Batches committed
    pub batches_committed: IntCounter,

    /// Batches rejected
    pub batches_rejected: IntCounter,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Top of ledger
    pub top_state_version: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_committed = IntCounter::new(
            "ledger_transactions_committed_total",
            "Transactions appended to the ledger",
        )?;
        registry.register(Box::new(transactions_committed.clone()))?;

        let batches_committed =
            IntCounter::new("ledger_batches_committed_total", "Batches committed")?;
        registry.register(Box::new(batches_committed.clone()))?;

        let batches_rejected =
            IntCounter::new("ledger_batches_rejected_total", "Batches rejected as invalid")?;
        registry.register(Box::new(batches_rejected.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("ledger_batch_size", "Histogram of committed batch sizes")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_commit_duration_seconds",
                "Histogram of batch commit latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        let top_state_version = IntGauge::new(
            "ledger_top_state_version",
            "State version at the top of the ledger",
        )?;
        registry.register(Box::new(top_state_version.clone()))?;

        Ok(Self {
            transactions_committed,
            batches_committed,
            batches_rejected,
            batch_size,
            commit_duration,
            top_state_version,
            registry,
        })
    }

    /// Record a committed batch
    pub fn record_commit(&self, transactions: usize, duration_seconds: f64, top_state_version: u64) {
        if transactions > 0 {
            self.transactions_committed.inc_by(transactions as u64);
            self.batches_committed.inc();
            self.batch_size.observe(transactions as f64);
        }
        self.commit_duration.observe(duration_seconds);
        self.top_state_version.set(top_state_version as i64);
    }

    /// Record a rejected batch
    pub fn record_rejection(&self) {
        self.batches_rejected.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
