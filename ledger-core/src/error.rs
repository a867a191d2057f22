//! Error types for the ledger

use crate::types::TransactionOpLocator;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// The ingested transaction breaks a ledger rule. Never retried.
    #[error("Invalid transaction at {locator}: {reason}")]
    InvalidTransaction {
        /// Where in the batch the violation was found
        locator: TransactionOpLocator,
        /// What rule was broken
        reason: String,
    },

    /// The durable ledger contradicts itself. Ingestion must stop.
    #[error("Inconsistent ledger: {0}")]
    InconsistentLedger(String),

    /// NaN or storage-unsafe amount used where a concrete value is required
    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    /// Hash input of the wrong size
    #[error("Invalid hash length: expected {expected} bytes, got {actual}")]
    InvalidHashLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an [`Error::InvalidTransaction`]
    pub fn invalid_transaction(locator: TransactionOpLocator, reason: impl Into<String>) -> Self {
        Error::InvalidTransaction {
            locator,
            reason: reason.into(),
        }
    }

    /// True for errors that require operator intervention before ingesting again
    pub fn is_inconsistent_ledger(&self) -> bool {
        matches!(self, Error::InconsistentLedger(_))
    }

    /// True when the batch was rejected because of its own contents
    pub fn is_invalid_transaction(&self) -> bool {
        matches!(self, Error::InvalidTransaction { .. })
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
