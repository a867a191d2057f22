//! Looped node workers
//!
//! A [`NodeWorker`] does one unit of work per iteration. [`LoopedWorker`]
//! drives it on its own task until cancelled, waiting between iterations
//! according to the worker's [`DelayBetweenLoops`].
//!
//! Outcomes of an iteration:
//! - success resets the consecutive error count
//! - ordinary errors are logged and retried with backoff
//! - an invalid transaction from the node stops the worker as faulted
//! - an app-fatal error stops the worker as fatal

use crate::backoff::DelayBetweenLoops;
use crate::confirmation::LedgerConfirmationService;
use crate::context::NodeContext;
use crate::error::{AppFatalClassifier, Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One unit of repeatable work against a node
#[async_trait]
pub trait NodeWorker: Send + Sync {
    /// Worker name, for logs and status
    fn name(&self) -> &str;

    /// Delay policy between iterations
    fn delay_between_loops(&self) -> &DelayBetweenLoops;

    /// Run one iteration
    async fn do_work(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Lifecycle state of a looped worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Looping
    Running,
    /// Cancelled and exited
    Stopped,
    /// Stopped after a rejected batch
    Faulted,
    /// Stopped after an app-fatal error
    Fatal,
}

impl WorkerState {
    /// Whether the loop has exited
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerState::Running)
    }
}

/// Snapshot of a looped worker
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    /// Worker name
    pub name: String,
    /// Current state
    pub state: WorkerState,
    /// Completed iterations, successful or not
    pub iterations: u64,
    /// Errors since the last success
    pub consecutive_errors: u32,
    /// Most recent error
    pub last_error: Option<String>,
}

/// A worker running on its own task
pub struct LoopedWorker {
    name: String,
    status: Arc<Mutex<WorkerStatus>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LoopedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopedWorker")
            .field("name", &self.name)
            .field("state", &self.status.lock().state)
            .finish()
    }
}

impl LoopedWorker {
    /// Spawn `worker` looping until `cancel` fires
    pub fn spawn(
        worker: Arc<dyn NodeWorker>,
        classifier: Arc<dyn AppFatalClassifier>,
        cancel: CancellationToken,
    ) -> Self {
        let name = worker.name().to_string();
        let status = Arc::new(Mutex::new(WorkerStatus {
            name: name.clone(),
            state: WorkerState::Running,
            iterations: 0,
            consecutive_errors: 0,
            last_error: None,
        }));

        let handle = tokio::spawn(run_loop(worker, classifier, cancel, status.clone()));

        Self {
            name,
            status,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status
    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    /// Wait for the loop to exit. Returns immediately if already joined.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(worker = %self.name, "Worker panicked");
                    self.status.lock().state = WorkerState::Faulted;
                }
            }
        }
    }

    /// Abort the task without waiting
    pub fn abort(&self) {
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.abort();
        }
    }
}

async fn run_loop(
    worker: Arc<dyn NodeWorker>,
    classifier: Arc<dyn AppFatalClassifier>,
    cancel: CancellationToken,
    status: Arc<Mutex<WorkerStatus>>,
) {
    let name = worker.name().to_string();
    let mut consecutive_errors: u32 = 0;
    debug!(worker = %name, "Worker started");

    let final_state = loop {
        if cancel.is_cancelled() {
            break WorkerState::Stopped;
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break WorkerState::Stopped,
            outcome = worker.do_work(&cancel) => outcome,
        };

        let delay = match outcome {
            Ok(()) => {
                consecutive_errors = 0;
                let mut status = status.lock();
                status.iterations += 1;
                status.consecutive_errors = 0;
                worker.delay_between_loops().delay_after_success(started.elapsed())
            }
            Err(Error::Cancelled) => break WorkerState::Stopped,
            Err(e) => {
                {
                    let mut status = status.lock();
                    status.iterations += 1;
                    status.last_error = Some(e.to_string());
                }

                if classifier.is_fatal(&e) {
                    error!(worker = %name, error = %e, "Worker hit an app-fatal error");
                    break WorkerState::Fatal;
                }
                if e.is_invalid_transaction() {
                    error!(worker = %name, error = %e, "Node delivered an invalid transaction, stopping worker");
                    break WorkerState::Faulted;
                }

                consecutive_errors = consecutive_errors.saturating_add(1);
                status.lock().consecutive_errors = consecutive_errors;
                let delay = worker
                    .delay_between_loops()
                    .delay_after_error(started.elapsed(), consecutive_errors);
                warn!(
                    worker = %name,
                    error = %e,
                    consecutive_errors,
                    retry_in_ms = delay.as_millis() as u64,
                    "Worker iteration failed"
                );
                delay
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break WorkerState::Stopped,
            _ = tokio::time::sleep(delay) => {}
        }
    };

    status.lock().state = final_state;
    debug!(worker = %name, state = ?final_state, "Worker exited");
}

/// Pulls committed transactions from a node into the confirmation stage
pub struct TransactionFetchWorker {
    name: String,
    context: NodeContext,
    delay: DelayBetweenLoops,
}

impl std::fmt::Debug for TransactionFetchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionFetchWorker")
            .field("name", &self.name)
            .finish()
    }
}

impl TransactionFetchWorker {
    /// Create a fetch worker using the context's fetch settings
    pub fn new(context: NodeContext) -> Result<Self> {
        let delay = context.fetch.delay_between_loops()?;
        Ok(Self {
            name: format!("{}/transaction-fetch", context.node.name),
            context,
            delay,
        })
    }
}

#[async_trait]
impl NodeWorker for TransactionFetchWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn delay_between_loops(&self) -> &DelayBetweenLoops {
        &self.delay
    }

    async fn do_work(&self, cancel: &CancellationToken) -> Result<()> {
        let node_name = &self.context.node.name;
        let confirmation = &self.context.confirmation;

        let Some(requested) = confirmation.requested_range(node_name) else {
            debug!(node = %node_name, "Nothing requested from node");
            return Ok(());
        };

        let max_count = requested.len().min(self.context.fetch.max_batch_size as u64) as usize;
        let transactions = self
            .context
            .source
            .fetch(requested.state_version_exclusive_lower_bound, max_count)
            .await?;
        let Some(last) = transactions.last() else {
            debug!(
                node = %node_name,
                state_version = requested.state_version_exclusive_lower_bound,
                "No new transactions"
            );
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        confirmation.submit_node_network_status(node_name, last.state_version, &last.accumulator);
        let fetched = transactions.len();
        let to_state_version = last.state_version;
        confirmation.submit_transactions(node_name, transactions)?;

        debug!(node = %node_name, fetched, to_state_version, "Submitted for confirmation");
        Ok(())
    }
}

/// Commits whatever run of transactions the node quorum agrees on
pub struct LedgerExtensionWorker {
    confirmation: Arc<LedgerConfirmationService>,
    delay: DelayBetweenLoops,
}

impl std::fmt::Debug for LedgerExtensionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerExtensionWorker").finish_non_exhaustive()
    }
}

impl LedgerExtensionWorker {
    /// Create the single extension worker for `confirmation`
    pub fn new(confirmation: Arc<LedgerConfirmationService>, delay: DelayBetweenLoops) -> Self {
        Self {
            confirmation,
            delay,
        }
    }
}

#[async_trait]
impl NodeWorker for LedgerExtensionWorker {
    fn name(&self) -> &str {
        "ledger-extension"
    }

    fn delay_between_loops(&self) -> &DelayBetweenLoops {
        &self.delay
    }

    async fn do_work(&self, _cancel: &CancellationToken) -> Result<()> {
        if let Some(report) = self.confirmation.handle_ledger_extension_if_quorum().await? {
            info!(
                committed = report.transactions_committed,
                skipped = report.transactions_skipped,
                state_version = report.top_of_ledger.state_version,
                "Ingested transactions"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DefaultFatalClassifier;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ScriptedWorker {
        delay: DelayBetweenLoops,
        calls: AtomicU32,
        fail_until: u32,
        error: fn() -> Error,
    }

    #[async_trait]
    impl NodeWorker for ScriptedWorker {
        fn name(&self) -> &str {
            "scripted"
        }

        fn delay_between_loops(&self) -> &DelayBetweenLoops {
            &self.delay
        }

        async fn do_work(&self, _cancel: &CancellationToken) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_until {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    fn scripted(fail_until: u32, error: fn() -> Error) -> Arc<ScriptedWorker> {
        Arc::new(ScriptedWorker {
            delay: DelayBetweenLoops::exponential(
                Duration::from_millis(200),
                Duration::from_secs(1),
                1,
                2.0,
                Duration::from_secs(30),
            )
            .unwrap(),
            calls: AtomicU32::new(0),
            fail_until,
            error,
        })
    }

    fn node_down() -> Error {
        Error::NodeApi {
            node: "node-a".to_string(),
            reason: "connection refused".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_then_recovers() {
        let worker = scripted(3, node_down);
        let cancel = CancellationToken::new();
        let looped = LoopedWorker::spawn(
            worker.clone(),
            Arc::new(DefaultFatalClassifier),
            cancel.clone(),
        );

        // Errors at t=0, 1s, 3s (delays 1s, 2s, 4s); success at 7s
        tokio::time::sleep(Duration::from_millis(6_900)).await;
        assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
        assert_eq!(looped.status().consecutive_errors, 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(worker.calls.load(Ordering::SeqCst), 4);
        assert_eq!(looped.status().consecutive_errors, 0);

        cancel.cancel();
        looped.join().await;
        assert_eq!(looped.status().state, WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_worker() {
        let worker = scripted(u32::MAX, || Error::AppFatal("disk gone".to_string()));
        let looped = LoopedWorker::spawn(
            worker.clone(),
            Arc::new(DefaultFatalClassifier),
            CancellationToken::new(),
        );

        looped.join().await;
        let status = looped.status();
        assert_eq!(status.state, WorkerState::Fatal);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert!(status.last_error.unwrap().contains("disk gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transaction_faults_worker() {
        let worker = scripted(u32::MAX, || {
            Error::Ledger(gateway_ledger_core::Error::InvalidTransaction {
                locator: gateway_ledger_core::TransactionOpLocator {
                    state_version: 5,
                    transaction_identifier: [5; 32],
                    operation_group_index: None,
                    operation_index: None,
                },
                reason: "bad accumulator".to_string(),
            })
        });
        let looped = LoopedWorker::spawn(
            worker,
            Arc::new(DefaultFatalClassifier),
            CancellationToken::new(),
        );

        looped.join().await;
        assert_eq!(looped.status().state, WorkerState::Faulted);
    }
}
