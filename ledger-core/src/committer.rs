//! Commit pipeline
//!
//! Turns a batch of node transactions into one atomic storage write:
//! chain continuity checks, substate application, aggregate history and the
//! new top of ledger either all land or none do.

use crate::accumulator;
use crate::amount::TokenAmount;
use crate::error::{Error, Result};
use crate::history::{
    AccountResourceBalance, AccountResourceKey, HistoryVersioner, ValidatorStakeSnapshot,
};
use crate::storage::Storage;
use crate::substates::{SubstateLedger, VirtualIdentifierRecognizer};
use crate::types::{
    CommitReport, CommittedTransaction, LedgerTransaction, OperationProvenance, SubstateContent,
    SubstateOperation, TopOfLedger, TransactionOpLocator,
};
use chrono::Utc;
use std::collections::BTreeMap;

/// Net value changes caused by one transaction
#[derive(Debug, Default)]
struct BalanceChanges {
    accounts: BTreeMap<(String, String), TokenAmount>,
    validators: BTreeMap<String, TokenAmount>,
}

impl BalanceChanges {
    fn record(&mut self, content: &SubstateContent, is_up: bool) {
        let apply = |total: &mut TokenAmount, amount: &TokenAmount| {
            if is_up {
                *total += amount;
            } else {
                *total -= amount;
            }
        };

        match content {
            SubstateContent::ResourceBalance {
                owner,
                resource,
                amount,
            } => apply(
                self.accounts
                    .entry((owner.clone(), resource.clone()))
                    .or_default(),
                amount,
            ),
            SubstateContent::ValidatorStake {
                validator, amount, ..
            } => apply(self.validators.entry(validator.clone()).or_default(), amount),
            SubstateContent::Data(_) => {}
        }
    }
}

/// Applies batches against durable storage
pub struct TransactionCommitter<'a> {
    storage: &'a Storage,
    recognizer: &'a dyn VirtualIdentifierRecognizer,
    verify_payload_hashes: bool,
}

impl<'a> TransactionCommitter<'a> {
    /// Create a committer
    pub fn new(
        storage: &'a Storage,
        recognizer: &'a dyn VirtualIdentifierRecognizer,
        verify_payload_hashes: bool,
    ) -> Self {
        Self {
            storage,
            recognizer,
            verify_payload_hashes,
        }
    }

    /// Commit `transactions` in one storage transaction.
    ///
    /// A leading run already present in the ledger is skipped. Any error leaves
    /// durable state, including the top of ledger, untouched.
    pub fn commit_batch(&self, transactions: &[CommittedTransaction]) -> Result<CommitReport> {
        let starting_tip = self.storage.top_of_ledger()?;
        let mut tip = starting_tip.clone();

        let mut substates = SubstateLedger::new(self.storage, self.recognizer);
        let mut balances = HistoryVersioner::<AccountResourceBalance>::new(self.storage);
        let mut stakes = HistoryVersioner::<ValidatorStakeSnapshot>::new(self.storage);
        let mut tx = self.storage.begin();

        let committed_at = Utc::now();
        let mut committed = 0;
        let mut skipped = 0;

        for transaction in transactions {
            if committed == 0 && transaction.state_version <= starting_tip.state_version {
                self.assert_already_committed(transaction)?;
                skipped += 1;
                continue;
            }

            self.assert_continues(&tip, transaction)?;
            self.apply_operations(transaction, &mut substates, &mut balances, &mut stakes)?;

            let next = tip.advance(transaction);
            tx.put_transaction(&LedgerTransaction {
                state_version: transaction.state_version,
                parent_state_version: transaction.parent_state_version,
                transaction_identifier: transaction.transaction_identifier,
                accumulator: transaction.accumulator,
                fee_paid: transaction.fee_paid.clone(),
                epoch: next.epoch,
                round_in_epoch: next.round_in_epoch,
                index_in_epoch: next.index_in_epoch.unwrap_or_default(),
                is_end_of_epoch: next.is_end_of_epoch,
                timestamp: transaction.timestamp,
                committed_at,
            })?;

            if let Some(mut tracked) = self
                .storage
                .get_mempool_transaction(&transaction.transaction_identifier)?
            {
                tracked.mark_committed(transaction.state_version);
                tx.put_mempool_transaction(&tracked)?;
            }

            tip = next;
            committed += 1;
        }

        if committed == 0 {
            return Ok(CommitReport {
                transactions_committed: 0,
                transactions_skipped: skipped,
                substates_upped: 0,
                substates_downed: 0,
                history_slices_written: 0,
                top_of_ledger: starting_tip,
            });
        }

        let stats = substates.flush(&mut tx)?;
        let history_slices_written = balances.flush(&mut tx)? + stakes.flush(&mut tx)?;
        tx.put_top_of_ledger(&tip)?;
        tx.commit()?;

        tracing::info!(
            from_state_version = starting_tip.state_version + 1,
            to_state_version = tip.state_version,
            epoch = tip.epoch,
            transactions = committed,
            skipped,
            "Batch committed"
        );

        Ok(CommitReport {
            transactions_committed: committed,
            transactions_skipped: skipped,
            substates_upped: stats.upped,
            substates_downed: stats.downed,
            history_slices_written,
            top_of_ledger: tip,
        })
    }

    fn assert_already_committed(&self, transaction: &CommittedTransaction) -> Result<()> {
        let locator = TransactionOpLocator::transaction(transaction);
        if transaction.state_version == 0 {
            return Err(Error::invalid_transaction(
                locator,
                "state version 0 is reserved for the empty ledger",
            ));
        }

        let stored = self
            .storage
            .get_transaction(transaction.state_version)?
            .ok_or_else(|| {
                Error::InconsistentLedger(format!(
                    "transaction {} is below the top of ledger but missing",
                    transaction.state_version
                ))
            })?;

        if stored.transaction_identifier != transaction.transaction_identifier
            || stored.accumulator != transaction.accumulator
        {
            return Err(Error::invalid_transaction(
                locator,
                format!(
                    "conflicts with committed transaction {} at the same state version",
                    hex::encode(stored.transaction_identifier)
                ),
            ));
        }
        Ok(())
    }

    fn assert_continues(&self, tip: &TopOfLedger, transaction: &CommittedTransaction) -> Result<()> {
        let locator = TransactionOpLocator::transaction(transaction);

        if transaction.parent_state_version != tip.state_version {
            return Err(Error::invalid_transaction(
                locator,
                format!(
                    "declares parent state version {} but the top of ledger is {}",
                    transaction.parent_state_version, tip.state_version
                ),
            ));
        }

        if transaction.state_version != tip.state_version + 1 {
            return Err(Error::invalid_transaction(
                locator,
                format!(
                    "state version {} does not directly follow its parent {}",
                    transaction.state_version, transaction.parent_state_version
                ),
            ));
        }

        if !accumulator::is_valid_continuation(
            &tip.accumulator,
            &transaction.transaction_identifier,
            &transaction.accumulator,
        )? {
            return Err(Error::invalid_transaction(
                locator,
                format!(
                    "accumulator {} does not continue parent accumulator {}",
                    hex::encode(transaction.accumulator),
                    hex::encode(tip.accumulator)
                ),
            ));
        }

        if self.verify_payload_hashes {
            if let Some(payload) = &transaction.payload {
                if !accumulator::is_valid_payload_hash(payload, &transaction.transaction_identifier) {
                    return Err(Error::invalid_transaction(
                        locator,
                        "transaction identifier is not the hash of its payload",
                    ));
                }
            }
        }

        Ok(())
    }

    fn apply_operations(
        &self,
        transaction: &CommittedTransaction,
        substates: &mut SubstateLedger<'_>,
        balances: &mut HistoryVersioner<'_, AccountResourceBalance>,
        stakes: &mut HistoryVersioner<'_, ValidatorStakeSnapshot>,
    ) -> Result<()> {
        let base_locator = TransactionOpLocator::transaction(transaction);
        let mut changes = BalanceChanges::default();

        for (group_index, group) in transaction.operation_groups.iter().enumerate() {
            for (operation_index, operation) in group.operations.iter().enumerate() {
                let locator = base_locator.at_operation(group_index, operation_index);
                let provenance = OperationProvenance {
                    state_version: transaction.state_version,
                    operation_group_index: group_index as u32,
                    operation_index: operation_index as u32,
                };

                match operation {
                    SubstateOperation::Up {
                        identifier,
                        content,
                    } => {
                        substates.up(identifier.clone(), || content.clone(), provenance, &locator)?;
                        changes.record(content, true);
                    }
                    SubstateOperation::Down {
                        identifier,
                        content,
                    } => {
                        substates.down_expecting(identifier.clone(), content, provenance, &locator)?;
                        changes.record(content, false);
                    }
                }
            }
        }

        let state_version = transaction.state_version;
        for ((account, resource), delta) in changes.accounts {
            if delta.is_zero() {
                continue;
            }
            balances.add_slice(
                AccountResourceKey { account, resource },
                |previous| AccountResourceBalance {
                    balance: previous.map(|p| &p.balance + &delta).unwrap_or_else(|| delta.clone()),
                },
                state_version,
            )?;
        }

        for (validator, delta) in changes.validators {
            if delta.is_zero() {
                continue;
            }
            stakes.add_slice(
                validator,
                |previous| ValidatorStakeSnapshot {
                    total_stake: previous.map(|p| &p.total_stake + &delta).unwrap_or_else(|| delta.clone()),
                },
                state_version,
            )?;
        }

        Ok(())
    }
}
