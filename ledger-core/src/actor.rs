//! Single-writer ledger actor
//!
//! Every node worker may race to extend the ledger, but only this actor
//! writes: commit requests queue in its mailbox and are applied one at a
//! time, each as a single atomic storage transaction.
//!
//! ```text
//!  fetch worker (node A) ─┐
//!  fetch worker (node B) ─┼──► LedgerHandle (Clone) ──► mpsc (bounded)
//!  gateway submissions ───┘                                 │
//!                                                           ▼
//!                                               LedgerActor (single task)
//!                                                 TransactionCommitter
//!                                                 StorageTransaction::commit
//! ```
//!
//! Once an [`Error::InconsistentLedger`] is observed the actor refuses all
//! further writes.

use crate::{
    accumulator::Hash32,
    committer::TransactionCommitter,
    mempool::{MempoolTransaction, MempoolTransactionStatus},
    metrics::Metrics,
    storage::Storage,
    substates::VirtualIdentifierRecognizer,
    types::{CommitReport, CommittedTransaction, TopOfLedger},
    Error, Result,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Commit a batch of transactions
    CommitBatch {
        transactions: Vec<CommittedTransaction>,
        response: oneshot::Sender<Result<CommitReport>>,
    },

    /// Read the current tip
    GetTopOfLedger {
        response: oneshot::Sender<Result<TopOfLedger>>,
    },

    /// Start tracking a submitted transaction
    TrackMempoolTransaction {
        transaction_identifier: Hash32,
        payload: Vec<u8>,
        response: oneshot::Sender<Result<MempoolTransaction>>,
    },

    /// Update the status of a tracked transaction
    SetMempoolStatus {
        transaction_identifier: Hash32,
        status: MempoolTransactionStatus,
        failure_reason: Option<String>,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns all ledger writes
pub struct LedgerActor {
    storage: Arc<Storage>,
    recognizer: Arc<dyn VirtualIdentifierRecognizer>,
    verify_payload_hashes: bool,
    metrics: Metrics,
    mailbox: mpsc::Receiver<LedgerMessage>,
    halted: Option<String>,
}

impl std::fmt::Debug for LedgerActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerActor")
            .field("storage", &self.storage)
            .field("halted", &self.halted)
            .finish()
    }
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        storage: Arc<Storage>,
        recognizer: Arc<dyn VirtualIdentifierRecognizer>,
        verify_payload_hashes: bool,
        metrics: Metrics,
        mailbox: mpsc::Receiver<LedgerMessage>,
    ) -> Self {
        Self {
            storage,
            recognizer,
            verify_payload_hashes,
            metrics,
            mailbox,
            halted: None,
        }
    }

    /// Run the actor event loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }
        tracing::info!("Ledger actor stopped");
    }

    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::CommitBatch {
                transactions,
                response,
            } => {
                let result = self.commit_batch(&transactions);
                let _ = response.send(result);
            }

            LedgerMessage::GetTopOfLedger { response } => {
                let _ = response.send(self.storage.top_of_ledger());
            }

            LedgerMessage::TrackMempoolTransaction {
                transaction_identifier,
                payload,
                response,
            } => {
                let result = self.track_mempool_transaction(transaction_identifier, payload);
                let _ = response.send(result);
            }

            LedgerMessage::SetMempoolStatus {
                transaction_identifier,
                status,
                failure_reason,
                response,
            } => {
                let result = self.set_mempool_status(&transaction_identifier, status, failure_reason);
                let _ = response.send(result);
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn ensure_not_halted(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(Error::InconsistentLedger(format!(
                "ingestion halted: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    fn commit_batch(&mut self, transactions: &[CommittedTransaction]) -> Result<CommitReport> {
        self.ensure_not_halted()?;

        let started = Instant::now();
        let committer = TransactionCommitter::new(
            &self.storage,
            self.recognizer.as_ref(),
            self.verify_payload_hashes,
        );

        match committer.commit_batch(transactions) {
            Ok(report) => {
                self.metrics.record_commit(
                    report.transactions_committed,
                    started.elapsed().as_secs_f64(),
                    report.top_of_ledger.state_version,
                );
                Ok(report)
            }
            Err(e) => {
                if e.is_invalid_transaction() {
                    self.metrics.record_rejection();
                    tracing::warn!(error = %e, "Batch rejected");
                } else if e.is_inconsistent_ledger() {
                    tracing::error!(error = %e, "Ledger is inconsistent, halting ingestion");
                    self.halted = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn track_mempool_transaction(
        &self,
        transaction_identifier: Hash32,
        payload: Vec<u8>,
    ) -> Result<MempoolTransaction> {
        if let Some(existing) = self.storage.get_mempool_transaction(&transaction_identifier)? {
            return Ok(existing);
        }

        let mut tracked = MempoolTransaction::submitted(transaction_identifier, payload);
        if let Some(committed) = self.storage.get_transaction_by_identifier(&transaction_identifier)? {
            tracked.mark_committed(committed.state_version);
        }

        let mut tx = self.storage.begin();
        tx.put_mempool_transaction(&tracked)?;
        tx.commit()?;

        tracing::debug!(
            transaction = %hex::encode(transaction_identifier),
            status = ?tracked.status,
            "Tracking mempool transaction"
        );
        Ok(tracked)
    }

    fn set_mempool_status(
        &self,
        transaction_identifier: &Hash32,
        status: MempoolTransactionStatus,
        failure_reason: Option<String>,
    ) -> Result<bool> {
        let mut tracked = self
            .storage
            .get_mempool_transaction(transaction_identifier)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "mempool transaction {}",
                    hex::encode(transaction_identifier)
                ))
            })?;

        if !tracked.set_status(status, failure_reason) {
            return Ok(false);
        }

        let mut tx = self.storage.begin();
        tx.put_mempool_transaction(&tracked)?;
        tx.commit()?;
        Ok(true)
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Commit a batch through the single writer
    pub async fn commit_batch(&self, transactions: Vec<CommittedTransaction>) -> Result<CommitReport> {
        self.request(|response| LedgerMessage::CommitBatch {
            transactions,
            response,
        })
        .await
    }

    /// Current tip, as seen by the writer
    pub async fn top_of_ledger(&self) -> Result<TopOfLedger> {
        self.request(|response| LedgerMessage::GetTopOfLedger { response })
            .await
    }

    /// Track a submitted transaction
    pub async fn track_mempool_transaction(
        &self,
        transaction_identifier: Hash32,
        payload: Vec<u8>,
    ) -> Result<MempoolTransaction> {
        self.request(|response| LedgerMessage::TrackMempoolTransaction {
            transaction_identifier,
            payload,
            response,
        })
        .await
    }

    /// Update a tracked transaction's status
    pub async fn set_mempool_status(
        &self,
        transaction_identifier: Hash32,
        status: MempoolTransactionStatus,
        failure_reason: Option<String>,
    ) -> Result<bool> {
        self.request(|response| LedgerMessage::SetMempoolStatus {
            transaction_identifier,
            status,
            failure_reason,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Arc<Storage>,
    recognizer: Arc<dyn VirtualIdentifierRecognizer>,
    verify_payload_hashes: bool,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = LedgerActor::new(storage, recognizer, verify_payload_hashes, metrics, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
