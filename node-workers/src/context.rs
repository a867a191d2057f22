//! Per-node scope
//!
//! Everything one node's workers need, built once per group by a
//! [`NodeContextFactory`] and dropped when the group is disposed.

use crate::config::{FetchConfig, NodeConfig};
use crate::confirmation::LedgerConfirmationService;
use crate::source::{HttpTransactionSource, NodeTransactionSource};
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Config and owned clients for one node
#[derive(Clone)]
pub struct NodeContext {
    /// Node this scope belongs to
    pub node: NodeConfig,

    /// Transaction source for the node
    pub source: Arc<dyn NodeTransactionSource>,

    /// Quorum stage the node's transactions are submitted to
    pub confirmation: Arc<LedgerConfirmationService>,

    /// Network the node must report
    pub expected_network: String,

    /// Fetch worker settings
    pub fetch: FetchConfig,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node.name)
            .field("expected_network", &self.expected_network)
            .finish_non_exhaustive()
    }
}

/// Builds the per-node scope for a worker group
pub trait NodeContextFactory: Send + Sync {
    /// Create the context for `node`
    fn create(&self, node: &NodeConfig) -> Result<NodeContext>;
}

/// Factory producing HTTP-backed node contexts
#[derive(Debug, Clone)]
pub struct HttpNodeContextFactory {
    confirmation: Arc<LedgerConfirmationService>,
    network: String,
    fetch: FetchConfig,
}

impl HttpNodeContextFactory {
    /// Create a factory sharing one confirmation service
    pub fn new(
        confirmation: Arc<LedgerConfirmationService>,
        network: impl Into<String>,
        fetch: FetchConfig,
    ) -> Self {
        Self {
            confirmation,
            network: network.into(),
            fetch,
        }
    }
}

impl NodeContextFactory for HttpNodeContextFactory {
    fn create(&self, node: &NodeConfig) -> Result<NodeContext> {
        let source = HttpTransactionSource::new(
            node.name.clone(),
            node.core_api_url.clone(),
            self.network.clone(),
            Duration::from_millis(node.request_timeout_ms),
        )?;

        Ok(NodeContext {
            node: node.clone(),
            source: Arc::new(source),
            confirmation: self.confirmation.clone(),
            expected_network: self.network.clone(),
            fetch: self.fetch.clone(),
        })
    }
}
