//! Error types for node workers

use thiserror::Error;

/// Result type for node worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Node worker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (commit rejected, storage failure, inconsistent ledger)
    #[error("Ledger error: {0}")]
    Ledger(#[from] gateway_ledger_core::Error),

    /// Node could not be brought into service
    #[error("Node {node} failed to initialize: {reason}")]
    NodeInitialization {
        /// Node name
        node: String,
        /// Reason
        reason: String,
    },

    /// Node API returned something unusable
    #[error("Node {node} API error: {reason}")]
    NodeApi {
        /// Node name
        node: String,
        /// Reason
        reason: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error the process cannot recover from
    #[error("Application-fatal error: {0}")]
    AppFatal(String),

    /// The quorum's ledger extension was rejected by the ledger
    #[error("Quorum extension rejected: {0}")]
    QuorumRejected(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// True when the ledger rejected a batch for breaking ledger rules
    pub fn is_invalid_transaction(&self) -> bool {
        matches!(self, Error::Ledger(e) if e.is_invalid_transaction())
    }
}

/// Decides whether an error must terminate the process
pub trait AppFatalClassifier: Send + Sync {
    /// Whether `error` is fatal
    fn is_fatal(&self, error: &Error) -> bool;
}

/// Inconsistent ledgers and explicit [`Error::AppFatal`] errors are fatal; everything else is retried
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFatalClassifier;

impl AppFatalClassifier for DefaultFatalClassifier {
    fn is_fatal(&self, error: &Error) -> bool {
        match error {
            Error::AppFatal(_) => true,
            Error::Ledger(e) => e.is_inconsistent_ledger(),
            _ => false,
        }
    }
}
