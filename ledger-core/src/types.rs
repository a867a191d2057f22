//! Core types for the ledger
//!
//! All persisted types serialize deterministically with bincode.

use crate::accumulator::{Hash32, PRE_GENESIS_ACCUMULATOR};
use crate::amount::TokenAmount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a transaction in the ledger. Version 0 is the empty ledger.
pub type StateVersion = u64;

/// Opaque substate identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubstateId(Vec<u8>);

impl SubstateId {
    /// Create new substate identifier
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SubstateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Kind of a substate, derived from its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubstateKind {
    /// Tokens of one resource held by an account
    ResourceBalance = 1,
    /// Stake delegated by an account to a validator
    ValidatorStake = 2,
    /// Anything the aggregator does not interpret
    Data = 3,
}

impl fmt::Display for SubstateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubstateKind::ResourceBalance => "resource balance",
            SubstateKind::ValidatorStake => "validator stake",
            SubstateKind::Data => "data",
        };
        f.write_str(name)
    }
}

/// Content of a substate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubstateContent {
    /// Account balance of a resource
    ResourceBalance {
        /// Owning account address
        owner: String,
        /// Resource identifier
        resource: String,
        /// Amount held
        amount: TokenAmount,
    },
    /// Stake an account delegated to a validator
    ValidatorStake {
        /// Validator address
        validator: String,
        /// Delegating account address
        owner: String,
        /// Amount staked
        amount: TokenAmount,
    },
    /// Uninterpreted bytes
    Data(Vec<u8>),
}

impl SubstateContent {
    /// Kind of this content
    pub fn kind(&self) -> SubstateKind {
        match self {
            SubstateContent::ResourceBalance { .. } => SubstateKind::ResourceBalance,
            SubstateContent::ValidatorStake { .. } => SubstateKind::ValidatorStake,
            SubstateContent::Data(_) => SubstateKind::Data,
        }
    }
}

/// One operation inside an operation group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubstateOperation {
    /// Create a substate
    Up {
        /// Identifier of the new substate
        identifier: SubstateId,
        /// Its content
        content: SubstateContent,
    },
    /// Spend a substate. `content` is what the node says is being spent.
    Down {
        /// Identifier of the spent substate
        identifier: SubstateId,
        /// Expected content at downing time
        content: SubstateContent,
    },
}

/// Ordered operations that belong together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationGroup {
    /// Operations in application order
    pub operations: Vec<SubstateOperation>,
}

/// A committed transaction as delivered by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedTransaction {
    /// State version this transaction occupies
    pub state_version: StateVersion,

    /// State version it builds on
    pub parent_state_version: StateVersion,

    /// Transaction identifier hash
    pub transaction_identifier: Hash32,

    /// Accumulator after this transaction
    pub accumulator: Hash32,

    /// Raw payload, when the node supplies it
    pub payload: Option<Vec<u8>>,

    /// Fee paid
    pub fee_paid: TokenAmount,

    /// Consensus round within the epoch
    pub round_in_epoch: u64,

    /// Whether this transaction closes its epoch
    pub ends_epoch: bool,

    /// Proposer timestamp
    pub timestamp: DateTime<Utc>,

    /// Substate operations
    pub operation_groups: Vec<OperationGroup>,
}

/// Where a ledger rule was broken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOpLocator {
    /// State version of the offending transaction
    pub state_version: StateVersion,
    /// Its identifier
    pub transaction_identifier: Hash32,
    /// Operation group index, if the problem is inside one
    pub operation_group_index: Option<usize>,
    /// Operation index within the group
    pub operation_index: Option<usize>,
}

impl TransactionOpLocator {
    /// Locator for a whole transaction
    pub fn transaction(transaction: &CommittedTransaction) -> Self {
        Self {
            state_version: transaction.state_version,
            transaction_identifier: transaction.transaction_identifier,
            operation_group_index: None,
            operation_index: None,
        }
    }

    /// Narrow the locator to one operation
    pub fn at_operation(&self, group_index: usize, operation_index: usize) -> Self {
        Self {
            operation_group_index: Some(group_index),
            operation_index: Some(operation_index),
            ..self.clone()
        }
    }
}

impl fmt::Display for TransactionOpLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state version {} (tx {})",
            self.state_version,
            hex::encode(self.transaction_identifier)
        )?;
        if let (Some(group), Some(operation)) = (self.operation_group_index, self.operation_index) {
            write!(f, " operation group {} operation {}", group, operation)?;
        }
        Ok(())
    }
}

/// Which operation created or spent a substate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProvenance {
    /// State version of the transaction
    pub state_version: StateVersion,
    /// Operation group index
    pub operation_group_index: u32,
    /// Operation index within the group
    pub operation_index: u32,
}

/// A substate and its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substate {
    /// Identifier
    pub identifier: SubstateId,
    /// Content
    pub content: SubstateContent,
    /// Operation that brought it up
    pub up: OperationProvenance,
    /// Operation that brought it down, once spent
    pub down: Option<OperationProvenance>,
}

impl Substate {
    /// Whether the substate has been spent
    pub fn is_down(&self) -> bool {
        self.down.is_some()
    }
}

/// Tip of the committed ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopOfLedger {
    /// Last committed state version
    pub state_version: StateVersion,
    /// Accumulator at that version
    pub accumulator: Hash32,
    /// Epoch of the last transaction
    pub epoch: u64,
    /// Round within the epoch
    pub round_in_epoch: u64,
    /// Index within the epoch; `None` before genesis
    pub index_in_epoch: Option<u64>,
    /// Whether the last transaction closed its epoch
    pub is_end_of_epoch: bool,
}

impl TopOfLedger {
    /// Tip of an empty ledger
    pub fn pre_genesis() -> Self {
        Self {
            state_version: 0,
            accumulator: PRE_GENESIS_ACCUMULATOR,
            epoch: 0,
            round_in_epoch: 0,
            index_in_epoch: None,
            is_end_of_epoch: false,
        }
    }

    /// Tip after appending `transaction` to this one
    pub fn advance(&self, transaction: &CommittedTransaction) -> Self {
        let (epoch, index_in_epoch) = if self.is_end_of_epoch {
            (self.epoch + 1, 0)
        } else {
            (self.epoch, self.index_in_epoch.map_or(0, |index| index + 1))
        };

        Self {
            state_version: transaction.state_version,
            accumulator: transaction.accumulator,
            epoch,
            round_in_epoch: transaction.round_in_epoch,
            index_in_epoch: Some(index_in_epoch),
            is_end_of_epoch: transaction.ends_epoch,
        }
    }
}

/// A transaction as persisted by the ledger (immutable, append-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// State version
    pub state_version: StateVersion,
    /// Parent state version
    pub parent_state_version: StateVersion,
    /// Transaction identifier hash
    pub transaction_identifier: Hash32,
    /// Accumulator after this transaction
    pub accumulator: Hash32,
    /// Fee paid
    pub fee_paid: TokenAmount,
    /// Epoch
    pub epoch: u64,
    /// Round within the epoch
    pub round_in_epoch: u64,
    /// Index within the epoch
    pub index_in_epoch: u64,
    /// Whether this transaction closed its epoch
    pub is_end_of_epoch: bool,
    /// Proposer timestamp
    pub timestamp: DateTime<Utc>,
    /// When the aggregator committed it
    pub committed_at: DateTime<Utc>,
}

/// Outcome of one committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    /// Transactions appended
    pub transactions_committed: usize,
    /// Transactions skipped because they were already committed
    pub transactions_skipped: usize,
    /// Substates brought up
    pub substates_upped: usize,
    /// Substates brought down
    pub substates_downed: usize,
    /// History slices written (new and closed)
    pub history_slices_written: usize,
    /// Tip after the batch
    pub top_of_ledger: TopOfLedger,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(state_version: StateVersion, ends_epoch: bool) -> CommittedTransaction {
        CommittedTransaction {
            state_version,
            parent_state_version: state_version - 1,
            transaction_identifier: [state_version as u8; 32],
            accumulator: [0u8; 32],
            payload: None,
            fee_paid: TokenAmount::zero(),
            round_in_epoch: 7,
            ends_epoch,
            timestamp: Utc::now(),
            operation_groups: Vec::new(),
        }
    }

    #[test]
    fn test_epoch_derivation() {
        let genesis = TopOfLedger::pre_genesis();
        let first = genesis.advance(&transaction(1, false));
        assert_eq!((first.epoch, first.index_in_epoch), (0, Some(0)));

        let second = first.advance(&transaction(2, true));
        assert_eq!((second.epoch, second.index_in_epoch), (0, Some(1)));
        assert!(second.is_end_of_epoch);

        let third = second.advance(&transaction(3, false));
        assert_eq!((third.epoch, third.index_in_epoch), (1, Some(0)));
        assert_eq!(third.round_in_epoch, 7);
    }

    #[test]
    fn test_locator_display() {
        let tx = transaction(4, false);
        let locator = TransactionOpLocator::transaction(&tx).at_operation(1, 2);
        let rendered = locator.to_string();
        assert!(rendered.starts_with("state version 4"));
        assert!(rendered.ends_with("operation group 1 operation 2"));
    }

    #[test]
    fn test_substate_id_display_is_hex() {
        assert_eq!(SubstateId::new(vec![0xab, 0x01]).to_string(), "ab01");
    }
}
