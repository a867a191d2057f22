//! Per-node worker groups
//!
//! Status transitions, all under the group's state lock:
//!
//! ```text
//! Unstarted -> Starting -> Running
//! Starting | Running -> Stopping -> Stopped
//! Unstarted -> Stopped
//! ```

use crate::config::NodeConfig;
use crate::context::{NodeContext, NodeContextFactory};
use crate::error::{AppFatalClassifier, Error, Result};
use crate::worker::{LoopedWorker, NodeWorker, TransactionFetchWorker, WorkerState, WorkerStatus};
use crate::GROUP_STATUS_GRACE;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle status of a worker group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Registered, not started
    Unstarted,
    /// Initializing the node
    Starting,
    /// Workers running
    Running,
    /// Cancelling workers
    Stopping,
    /// All workers exited
    Stopped,
}

/// Health as seen by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupHealth {
    /// Running as expected
    Healthy,
    /// Should be stopped and restarted later
    Unhealthy(String),
    /// A worker hit an app-fatal error; the process must stop
    Fatal(String),
}

#[derive(Debug)]
struct GroupState {
    status: GroupStatus,
    last_status_change: Instant,
}

/// Workers and scope for one node
pub struct NodeWorkerGroup {
    node: NodeConfig,
    classifier: Arc<dyn AppFatalClassifier>,
    cancel: CancellationToken,
    state: Mutex<GroupState>,
    context: Mutex<Option<NodeContext>>,
    workers: Mutex<Vec<Arc<LoopedWorker>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for NodeWorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWorkerGroup")
            .field("node", &self.node.name)
            .field("status", &self.status())
            .finish()
    }
}

impl NodeWorkerGroup {
    /// Register an unstarted group whose cancellation is linked to `parent`
    pub fn new(
        node: NodeConfig,
        classifier: Arc<dyn AppFatalClassifier>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            node,
            classifier,
            cancel: parent.child_token(),
            state: Mutex::new(GroupState {
                status: GroupStatus::Unstarted,
                last_status_change: Instant::now(),
            }),
            context: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Node served by this group
    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    /// Current status
    pub fn status(&self) -> GroupStatus {
        self.state.lock().status
    }

    /// Whether the group is stopping or stopped
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.status(),
            GroupStatus::Stopping | GroupStatus::Stopped
        )
    }

    /// Move to `to` if the current status is one of `from`
    fn transition(&self, from: &[GroupStatus], to: GroupStatus) -> Option<GroupStatus> {
        let mut state = self.state.lock();
        let previous = state.status;
        if !from.contains(&previous) {
            return None;
        }
        state.status = to;
        state.last_status_change = Instant::now();
        Some(previous)
    }

    /// Build the node's context, check its network and start its workers.
    ///
    /// Fails with [`Error::NodeInitialization`] if the node is unreachable or
    /// on the wrong network.
    pub async fn start(&self, factory: &dyn NodeContextFactory) -> Result<()> {
        if self
            .transition(&[GroupStatus::Unstarted], GroupStatus::Starting)
            .is_none()
        {
            return Err(Error::NodeInitialization {
                node: self.node.name.clone(),
                reason: format!("cannot start a group that is {:?}", self.status()),
            });
        }

        let context = factory.create(&self.node)?;

        let reported = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            reported = context.source.network_identity() => reported,
        };
        let reported = reported.map_err(|e| Error::NodeInitialization {
            node: self.node.name.clone(),
            reason: format!("network identity unavailable: {}", e),
        })?;

        if reported != context.expected_network {
            return Err(Error::NodeInitialization {
                node: self.node.name.clone(),
                reason: format!(
                    "node is on network {}, expected {}",
                    reported, context.expected_network
                ),
            });
        }

        let worker: Arc<dyn NodeWorker> = Arc::new(TransactionFetchWorker::new(context.clone())?);
        *self.context.lock() = Some(context);

        // A concurrent stop may have won while we were initializing
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let looped = LoopedWorker::spawn(worker, self.classifier.clone(), self.cancel.clone());
        self.workers.lock().push(Arc::new(looped));

        if self
            .transition(&[GroupStatus::Starting], GroupStatus::Running)
            .is_none()
        {
            return Err(Error::Cancelled);
        }

        info!(node = %self.node.name, url = %self.node.core_api_url, "Node worker group running");
        Ok(())
    }

    /// Cancel the workers and wait for them to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let previous = self.transition(
            &[
                GroupStatus::Unstarted,
                GroupStatus::Starting,
                GroupStatus::Running,
            ],
            GroupStatus::Stopping,
        );
        if previous.is_none() {
            return;
        }

        self.cancel.cancel();

        let workers = self.workers.lock().clone();
        for worker in &workers {
            worker.join().await;
        }

        self.transition(&[GroupStatus::Stopping], GroupStatus::Stopped);
        info!(node = %self.node.name, "Node worker group stopped");
    }

    /// Cancel the scope and release workers and context. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.context.lock().take();
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Health at `now`.
    ///
    /// Fatal if any worker stopped on an app-fatal error; unhealthy if a
    /// worker exited or the group has been out of `Running` past the grace
    /// period.
    pub fn health(&self, now: Instant) -> GroupHealth {
        let statuses = self.worker_statuses();

        if let Some(fatal) = statuses.iter().find(|s| s.state == WorkerState::Fatal) {
            return GroupHealth::Fatal(format!(
                "worker {} failed: {}",
                fatal.name,
                fatal.last_error.as_deref().unwrap_or("unknown error")
            ));
        }

        let (status, since) = {
            let state = self.state.lock();
            (state.status, state.last_status_change)
        };

        if status == GroupStatus::Running {
            if let Some(exited) = statuses.iter().find(|s| s.state.is_terminal()) {
                return GroupHealth::Unhealthy(format!(
                    "worker {} is {:?}",
                    exited.name, exited.state
                ));
            }
            return GroupHealth::Healthy;
        }

        let stalled_for = now.saturating_duration_since(since);
        if stalled_for > GROUP_STATUS_GRACE {
            return GroupHealth::Unhealthy(format!(
                "{:?} for {}s",
                status,
                stalled_for.as_secs()
            ));
        }
        GroupHealth::Healthy
    }

    /// Status of every worker
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.workers.lock().iter().map(|w| w.status()).collect()
    }
}
