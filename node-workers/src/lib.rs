//! Gateway Node Workers
//!
//! Keeps one worker group per configured full node, each polling its node
//! for committed transactions. Transactions are only handed to the ledger's
//! single writer once a trust-weighted quorum of nodes agrees on them.
//!
//! # Architecture
//!
//! - **Supervisor**: Reconciles running groups against the enabled node list
//! - **Startup Blocklist**: Nodes that fail to start are left alone for a cool-down window
//! - **Worker Groups**: Per-node lifecycle (start, stop, dispose) and health
//! - **Looped Workers**: Cancellable loops with exponential backoff after errors
//! - **Confirmation**: Per-node transaction pipelines voted on by trust weight

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod backoff;
pub mod config;
pub mod confirmation;
pub mod context;
pub mod error;
pub mod group;
pub mod metrics;
pub mod source;
pub mod supervisor;
pub mod worker;

// Re-exports
pub use backoff::DelayBetweenLoops;
pub use config::{AggregatorConfig, ConfirmationConfig, FetchConfig, NodeConfig};
pub use confirmation::{LedgerConfirmationService, TransactionsRequested};
pub use context::{HttpNodeContextFactory, NodeContext, NodeContextFactory};
pub use error::{AppFatalClassifier, DefaultFatalClassifier, Error, Result};
pub use group::{GroupHealth, GroupStatus, NodeWorkerGroup};
pub use metrics::{ConfirmationMetrics, MetricStatus};
pub use source::{HttpTransactionSource, NodeTransactionSource};
pub use supervisor::{NodeStatusSnapshot, NodeWorkerSupervisor};
pub use worker::{
    LedgerExtensionWorker, LoopedWorker, NodeWorker, TransactionFetchWorker, WorkerState,
    WorkerStatus,
};

/// Default node API request timeout (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// How long a group may sit outside `Running` before it counts as unhealthy
pub const GROUP_STATUS_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// Default startup blocklist cool-down
pub const DEFAULT_STARTUP_BLOCKLIST: std::time::Duration = std::time::Duration::from_secs(20);
