//! Gateway Ledger Core
//!
//! Ingestion and consistency engine for a ledger mirrored from untrusted
//! full nodes.
//!
//! # Architecture
//!
//! - **Accumulator Chain**: Every batch must extend the running hash chain from the current tip
//! - **Single Writer**: One actor applies commits, however many node workers race to fetch
//! - **Substates**: UTXO-like up/down facts with operation provenance
//! - **History Slices**: Aggregates versioned over inclusive state-version ranges
//!
//! # Invariants
//!
//! - State versions are gapless and strictly increasing
//! - At most one substate per identifier; a down substate never comes back up
//! - At most one open history slice per aggregate key
//! - A failed batch leaves durable state untouched

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accumulator;
pub mod actor;
pub mod amount;
pub mod committer;
pub mod config;
pub mod error;
pub mod history;
pub mod ledger;
pub mod mempool;
pub mod metrics;
pub mod storage;
pub mod substates;
pub mod types;

// Re-exports
pub use actor::LedgerHandle;
pub use amount::TokenAmount;
pub use config::Config;
pub use error::{Error, Result};
pub use history::{
    AccountResourceBalance, AccountResourceKey, HistoryAggregate, HistorySlice,
    HistoryVersioner, ValidatorStakeSnapshot,
};
pub use ledger::Ledger;
pub use mempool::{MempoolTransaction, MempoolTransactionStatus};
pub use storage::{Storage, StorageTransaction};
pub use substates::{
    NoVirtualSubstates, PrefixVirtualRecognizer, SubstateLedger, VirtualIdentifierRecognizer,
};
pub use types::{
    CommitReport, CommittedTransaction, LedgerTransaction, OperationGroup, OperationProvenance,
    StateVersion, Substate, SubstateContent, SubstateId, SubstateKind, SubstateOperation,
    TopOfLedger, TransactionOpLocator,
};
