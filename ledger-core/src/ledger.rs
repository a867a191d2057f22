//! Ledger facade
//!
//! Ties storage, the single-writer actor and metrics together. Writes go
//! through the actor; read-side queries hit storage directly.
//!
//! # Example
//!
//! ```no_run
//! use gateway_ledger_core::{Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> gateway_ledger_core::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let tip = ledger.top_of_ledger()?;
//!     println!("ledger at state version {}", tip.state_version);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    accumulator::Hash32,
    actor::{spawn_ledger_actor, LedgerHandle},
    history::{HistoryAggregate, HistorySlice},
    mempool::{MempoolTransaction, MempoolTransactionStatus},
    metrics::Metrics,
    storage::Storage,
    substates::{NoVirtualSubstates, PrefixVirtualRecognizer, VirtualIdentifierRecognizer},
    types::{CommitReport, CommittedTransaction, LedgerTransaction, StateVersion, Substate, SubstateId, TopOfLedger},
    Config, Error, Result,
};
use std::sync::Arc;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger, recognizing virtual substates by the configured prefix
    pub async fn open(config: Config) -> Result<Self> {
        let recognizer: Arc<dyn VirtualIdentifierRecognizer> =
            match config.ingestion.virtual_prefix_bytes()? {
                Some(prefix) => Arc::new(PrefixVirtualRecognizer::new(prefix)),
                None => Arc::new(NoVirtualSubstates),
            };
        Self::open_with_recognizer(config, recognizer).await
    }

    /// Open ledger with a custom virtual identifier recognizer.
    ///
    /// Fails with [`Error::InconsistentLedger`] if the stored tip contradicts the stored chain.
    pub async fn open_with_recognizer(
        config: Config,
        recognizer: Arc<dyn VirtualIdentifierRecognizer>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let tip = storage.verify_top_of_ledger()?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;
        metrics.top_state_version.set(tip.state_version as i64);

        let handle = spawn_ledger_actor(
            storage.clone(),
            recognizer,
            config.ingestion.verify_payload_hashes,
            metrics.clone(),
            config.ingestion.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            state_version = tip.state_version,
            epoch = tip.epoch,
            "Ledger opened"
        );

        Ok(Self {
            handle,
            storage,
            metrics,
            config,
        })
    }

    /// Handle for node workers and other writers
    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Commit a batch through the single writer
    pub async fn commit_batch(&self, transactions: Vec<CommittedTransaction>) -> Result<CommitReport> {
        self.handle.commit_batch(transactions).await
    }

    // Read side

    /// Current tip
    pub fn top_of_ledger(&self) -> Result<TopOfLedger> {
        self.storage.top_of_ledger()
    }

    /// Transaction at `state_version`
    pub fn get_transaction(&self, state_version: StateVersion) -> Result<Option<LedgerTransaction>> {
        self.storage.get_transaction(state_version)
    }

    /// Transaction by identifier hash
    pub fn get_transaction_by_identifier(&self, identifier: &Hash32) -> Result<Option<LedgerTransaction>> {
        self.storage.get_transaction_by_identifier(identifier)
    }

    /// Substate by identifier
    pub fn get_substate(&self, identifier: &SubstateId) -> Result<Option<Substate>> {
        self.storage.get_substate(identifier)
    }

    /// Current history slice for `key`
    pub fn current_history<A: HistoryAggregate>(&self, key: &A::Key) -> Result<Option<HistorySlice<A>>> {
        self.storage.get_open_history::<A>(key)
    }

    /// History slice for `key` at `state_version`
    pub fn history_at<A: HistoryAggregate>(
        &self,
        key: &A::Key,
        state_version: StateVersion,
    ) -> Result<Option<HistorySlice<A>>> {
        self.storage.get_history_at::<A>(key, state_version)
    }

    /// Every history slice for `key`, oldest first
    pub fn history<A: HistoryAggregate>(&self, key: &A::Key) -> Result<Vec<HistorySlice<A>>> {
        self.storage.get_history::<A>(key)
    }

    // Mempool

    /// Track a submitted transaction
    pub async fn track_mempool_transaction(
        &self,
        transaction_identifier: Hash32,
        payload: Vec<u8>,
    ) -> Result<MempoolTransaction> {
        self.handle
            .track_mempool_transaction(transaction_identifier, payload)
            .await
    }

    /// Update a tracked transaction's status
    pub async fn set_mempool_status(
        &self,
        transaction_identifier: Hash32,
        status: MempoolTransactionStatus,
        failure_reason: Option<String>,
    ) -> Result<bool> {
        self.handle
            .set_mempool_status(transaction_identifier, status, failure_reason)
            .await
    }

    /// Tracked transaction
    pub fn mempool_transaction(&self, transaction_identifier: &Hash32) -> Result<Option<MempoolTransaction>> {
        self.storage.get_mempool_transaction(transaction_identifier)
    }

    // Integrity

    /// Re-walk the stored accumulator chain up to the tip
    pub fn verify_chain(&self) -> Result<()> {
        let tip = self.storage.top_of_ledger()?;
        self.storage.verify_chain(0, tip.state_version)
    }

    /// Stop the writer
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}
