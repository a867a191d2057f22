//! Node worker supervisor
//!
//! Keeps one [`NodeWorkerGroup`] per enabled node. Each reconciliation pass
//! stops groups that are stopped, unhealthy or no longer enabled, and starts
//! groups for enabled nodes that are neither running nor blocklisted. Both
//! sets run concurrently.
//!
//! A node whose start fails with a non-fatal error is blocklisted for the
//! cool-down window and its group torn down. App-fatal failures, at start or
//! from a running worker, are returned to the caller, which must terminate.

use crate::config::NodeConfig;
use crate::context::NodeContextFactory;
use crate::error::{AppFatalClassifier, Error, Result};
use crate::group::{GroupHealth, GroupStatus, NodeWorkerGroup};
use crate::worker::WorkerStatus;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-node view for health checks
#[derive(Debug, Clone)]
pub struct NodeStatusSnapshot {
    /// Node name
    pub node: String,
    /// Group status
    pub status: GroupStatus,
    /// Group health
    pub health: GroupHealth,
    /// Worker statuses
    pub workers: Vec<WorkerStatus>,
}

/// Why a running group is being stopped
#[derive(Debug)]
enum StopReason {
    Disabled,
    Stopped,
    Unhealthy(String),
}

/// Supervises worker groups for all configured nodes
pub struct NodeWorkerSupervisor {
    factory: Arc<dyn NodeContextFactory>,
    classifier: Arc<dyn AppFatalClassifier>,
    groups: Mutex<HashMap<NodeConfig, Arc<NodeWorkerGroup>>>,
    blocklist: Mutex<HashMap<String, Instant>>,
    cool_down: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NodeWorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWorkerSupervisor")
            .field("groups", &self.groups.lock().len())
            .field("blocklisted", &self.blocklist.lock().len())
            .field("cool_down", &self.cool_down)
            .finish()
    }
}

impl NodeWorkerSupervisor {
    /// Create a supervisor blocklisting failed nodes for `cool_down`
    pub fn new(
        factory: Arc<dyn NodeContextFactory>,
        classifier: Arc<dyn AppFatalClassifier>,
        cool_down: Duration,
    ) -> Self {
        Self {
            factory,
            classifier,
            groups: Mutex::new(HashMap::new()),
            blocklist: Mutex::new(HashMap::new()),
            cool_down,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether `node_name` is currently blocklisted
    pub fn is_blocklisted(&self, node_name: &str) -> bool {
        let now = Instant::now();
        self.blocklist
            .lock()
            .get(node_name)
            .is_some_and(|until| *until > now)
    }

    fn blocklist_node(&self, node_name: &str) {
        self.blocklist
            .lock()
            .insert(node_name.to_string(), Instant::now() + self.cool_down);
    }

    /// Bring running groups in line with `enabled`.
    ///
    /// Returns an error only for app-fatal failures.
    pub async fn reconcile(&self, enabled: &[NodeConfig]) -> Result<()> {
        let now = Instant::now();
        self.blocklist.lock().retain(|_, until| *until > now);

        let (to_stop, to_start) = {
            let mut groups = self.groups.lock();

            for (node, group) in groups.iter() {
                if let GroupHealth::Fatal(reason) = group.health(now) {
                    error!(node = %node.name, reason = %reason, "Node worker group failed fatally");
                    return Err(Error::AppFatal(format!("node {}: {}", node.name, reason)));
                }
            }

            let mut to_stop = Vec::new();
            for (node, group) in groups.iter() {
                let reason = if !enabled.contains(node) {
                    Some(StopReason::Disabled)
                } else if group.is_stopped() {
                    Some(StopReason::Stopped)
                } else if let GroupHealth::Unhealthy(reason) = group.health(now) {
                    Some(StopReason::Unhealthy(reason))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    to_stop.push((group.clone(), reason));
                }
            }
            for (group, reason) in &to_stop {
                groups.remove(group.node());
                match reason {
                    StopReason::Unhealthy(detail) => {
                        warn!(node = %group.node().name, reason = %detail, "Stopping unhealthy node worker group");
                        self.blocklist_node(&group.node().name);
                    }
                    other => {
                        info!(node = %group.node().name, reason = ?other, "Stopping node worker group");
                    }
                }
            }

            let mut to_start = Vec::new();
            for node in enabled {
                if groups.contains_key(node) || self.is_blocklisted(&node.name) {
                    continue;
                }
                let group = Arc::new(NodeWorkerGroup::new(
                    node.clone(),
                    self.classifier.clone(),
                    &self.shutdown,
                ));
                groups.insert(node.clone(), group.clone());
                to_start.push(group);
            }

            (to_stop, to_start)
        };

        let stops = join_all(to_stop.iter().map(|(group, _)| async move {
            group.stop().await;
            group.dispose();
        }));
        let starts = join_all(to_start.iter().map(|group| self.start_group(group.clone())));
        let (_, start_results) = futures::join!(stops, starts);

        start_results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn start_group(&self, group: Arc<NodeWorkerGroup>) -> Result<()> {
        let node_name = group.node().name.clone();

        let outcome = group.start(self.factory.as_ref()).await;
        let Err(e) = outcome else {
            return Ok(());
        };

        {
            let mut groups = self.groups.lock();
            if groups
                .get(group.node())
                .is_some_and(|current| Arc::ptr_eq(current, &group))
            {
                groups.remove(group.node());
            }
        }
        group.stop().await;
        group.dispose();

        if self.classifier.is_fatal(&e) {
            error!(node = %node_name, error = %e, "Node failed to start with an app-fatal error");
            return Err(e);
        }
        if matches!(e, Error::Cancelled) {
            return Ok(());
        }

        warn!(
            node = %node_name,
            error = %e,
            cool_down_secs = self.cool_down.as_secs(),
            "Node failed to start, blocklisting"
        );
        self.blocklist_node(&node_name);
        Ok(())
    }

    /// Reconcile every `interval` until `cancel` fires or a fatal error occurs
    pub async fn run(
        &self,
        nodes: Vec<NodeConfig>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(nodes = nodes.len(), interval_ms = interval.as_millis() as u64, "Supervisor running");

        loop {
            self.reconcile(&nodes).await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Supervisor loop exited");
        Ok(())
    }

    /// Stop every group, then dispose them. Safe to call repeatedly.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();

        let groups: Vec<Arc<NodeWorkerGroup>> = self.groups.lock().drain().map(|(_, g)| g).collect();
        join_all(groups.iter().map(|group| group.stop())).await;
        for group in &groups {
            group.dispose();
        }

        if !groups.is_empty() {
            info!(groups = groups.len(), "All node worker groups stopped");
        }
    }

    /// Status and health of every group
    pub fn snapshot(&self) -> Vec<NodeStatusSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<NodeStatusSnapshot> = self
            .groups
            .lock()
            .values()
            .map(|group| NodeStatusSnapshot {
                node: group.node().name.clone(),
                status: group.status(),
                health: group.health(now),
                workers: group.worker_statuses(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.node.cmp(&b.node));
        snapshots
    }
}
