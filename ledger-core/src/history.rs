//! Time-sliced aggregate history
//!
//! Every aggregate kind keeps, per entity key, a sequence of slices covering
//! consecutive state-version ranges. At most one slice per key is open
//! (`to_state_version == None`).
//!
//! Ranges are inclusive on both ends and never overlap: adding a slice at
//! version `v` closes the previous one at `v - 1`.

use crate::amount::TokenAmount;
use crate::error::{Error, Result};
use crate::storage::{Storage, StorageTransaction};
use crate::types::StateVersion;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Storage discriminant of an aggregate kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HistoryKind {
    /// [`AccountResourceBalance`]
    AccountResourceBalance = 1,
    /// [`ValidatorStakeSnapshot`]
    ValidatorStake = 2,
}

/// A value tracked over time per entity key
pub trait HistoryAggregate: Clone + Debug + Serialize + DeserializeOwned + Send + Sync {
    /// Entity key the history is partitioned by
    type Key: Clone + Debug + Eq + Hash + Serialize + DeserializeOwned + Send + Sync;

    /// Storage discriminant
    const KIND: HistoryKind;
}

/// One version range of an aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySlice<A> {
    /// First state version the value holds at
    pub from_state_version: StateVersion,
    /// Last state version it holds at; `None` while current
    pub to_state_version: Option<StateVersion>,
    /// The value
    pub value: A,
}

impl<A> HistorySlice<A> {
    /// Whether this is the current slice
    pub fn is_open(&self) -> bool {
        self.to_state_version.is_none()
    }

    /// Whether the slice covers `state_version`
    pub fn contains(&self, state_version: StateVersion) -> bool {
        self.from_state_version <= state_version
            && self.to_state_version.map_or(true, |to| state_version <= to)
    }
}

/// Key of [`AccountResourceBalance`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountResourceKey {
    /// Account address
    pub account: String,
    /// Resource identifier
    pub resource: String,
}

/// Balance of one resource held by one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResourceBalance {
    /// Balance
    pub balance: TokenAmount,
}

impl HistoryAggregate for AccountResourceBalance {
    type Key = AccountResourceKey;
    const KIND: HistoryKind = HistoryKind::AccountResourceBalance;
}

/// Total stake delegated to a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStakeSnapshot {
    /// Sum of all delegated stake
    pub total_stake: TokenAmount,
}

impl HistoryAggregate for ValidatorStakeSnapshot {
    type Key = String;
    const KIND: HistoryKind = HistoryKind::ValidatorStake;
}

#[derive(Debug)]
struct PendingSlices<A> {
    closed: Vec<HistorySlice<A>>,
    open: HistorySlice<A>,
}

/// Stages history slices for one aggregate kind within a batch.
///
/// Lookups consult staged slices before durable storage.
pub struct HistoryVersioner<'s, A: HistoryAggregate> {
    storage: &'s Storage,
    pending: HashMap<A::Key, PendingSlices<A>>,
}

impl<'s, A: HistoryAggregate> HistoryVersioner<'s, A> {
    /// Create a versioner reading through to `storage`
    pub fn new(storage: &'s Storage) -> Self {
        Self {
            storage,
            pending: HashMap::new(),
        }
    }

    /// Current slice for `key`, staged or durable
    pub fn current(&self, key: &A::Key) -> Result<Option<HistorySlice<A>>> {
        match self.pending.get(key) {
            Some(pending) => Ok(Some(pending.open.clone())),
            None => self.storage.get_open_history::<A>(key),
        }
    }

    /// Opens a slice holding `factory(previous)` at `at_state_version`, closing the previous one.
    ///
    /// A second change at the same state version replaces the open value in place.
    pub fn add_slice<F>(&mut self, key: A::Key, factory: F, at_state_version: StateVersion) -> Result<()>
    where
        F: FnOnce(Option<&A>) -> A,
    {
        let existing = match self.pending.remove(&key) {
            Some(pending) => Some(pending),
            None => self
                .storage
                .get_open_history::<A>(&key)?
                .map(|open| PendingSlices {
                    closed: Vec::new(),
                    open,
                }),
        };

        let Some(mut current) = existing else {
            let open = HistorySlice {
                from_state_version: at_state_version,
                to_state_version: None,
                value: factory(None),
            };
            self.pending.insert(key, PendingSlices { closed: Vec::new(), open });
            return Ok(());
        };

        let from = current.open.from_state_version;
        if at_state_version < from {
            return Err(Error::InconsistentLedger(format!(
                "{:?} history for {:?} is open from state version {}, cannot add slice at {}",
                A::KIND,
                key,
                from,
                at_state_version
            )));
        }

        if at_state_version == from {
            current.open.value = factory(Some(&current.open.value));
        } else {
            let value = factory(Some(&current.open.value));
            let mut closed = std::mem::replace(
                &mut current.open,
                HistorySlice {
                    from_state_version: at_state_version,
                    to_state_version: None,
                    value,
                },
            );
            closed.to_state_version = Some(at_state_version - 1);
            current.closed.push(closed);
        }

        self.pending.insert(key, current);
        Ok(())
    }

    /// Writes staged slices into `tx`, returning how many were written
    pub fn flush(self, tx: &mut StorageTransaction<'_>) -> Result<usize> {
        let mut written = 0;
        for (key, pending) in self.pending {
            for closed in &pending.closed {
                tx.put_history_slice::<A>(&key, closed)?;
                written += 1;
            }
            tx.put_history_slice::<A>(&key, &pending.open)?;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn balance(units: i64) -> AccountResourceBalance {
        AccountResourceBalance {
            balance: TokenAmount::from_whole_units(units),
        }
    }

    fn key() -> AccountResourceKey {
        AccountResourceKey {
            account: "account_1".to_string(),
            resource: "xrd".to_string(),
        }
    }

    fn add(previous: Option<&AccountResourceBalance>, units: i64) -> AccountResourceBalance {
        let base = previous.map(|p| p.balance.clone()).unwrap_or_default();
        AccountResourceBalance {
            balance: base + TokenAmount::from_whole_units(units),
        }
    }

    #[test]
    fn test_first_slice_is_open() {
        let (storage, _dir) = test_storage();
        let mut versioner = HistoryVersioner::<AccountResourceBalance>::new(&storage);

        versioner.add_slice(key(), |prev| add(prev, 5), 3).unwrap();

        let current = versioner.current(&key()).unwrap().unwrap();
        assert_eq!(current.from_state_version, 3);
        assert!(current.is_open());
        assert_eq!(current.value, balance(5));
    }

    #[test]
    fn test_slices_close_before_next_version() {
        let (storage, _dir) = test_storage();

        let mut versioner = HistoryVersioner::<AccountResourceBalance>::new(&storage);
        versioner.add_slice(key(), |prev| add(prev, 5), 3).unwrap();
        versioner.add_slice(key(), |prev| add(prev, 2), 7).unwrap();

        let mut tx = storage.begin();
        assert_eq!(versioner.flush(&mut tx).unwrap(), 2);
        tx.commit().unwrap();

        // Continue from durable storage in a later batch
        let mut versioner = HistoryVersioner::<AccountResourceBalance>::new(&storage);
        versioner.add_slice(key(), |prev| add(prev, -1), 10).unwrap();
        let mut tx = storage.begin();
        versioner.flush(&mut tx).unwrap();
        tx.commit().unwrap();

        let history = storage.get_history::<AccountResourceBalance>(&key()).unwrap();
        let ranges: Vec<_> = history
            .iter()
            .map(|s| (s.from_state_version, s.to_state_version))
            .collect();
        assert_eq!(ranges, vec![(3, Some(6)), (7, Some(9)), (10, None)]);
        assert_eq!(history[2].value, balance(6));
        assert_eq!(history.iter().filter(|s| s.is_open()).count(), 1);

        let at_8 = storage.get_history_at::<AccountResourceBalance>(&key(), 8).unwrap().unwrap();
        assert_eq!(at_8.value, balance(7));
        assert!(storage.get_history_at::<AccountResourceBalance>(&key(), 2).unwrap().is_none());
    }

    #[test]
    fn test_same_version_replaces_in_place() {
        let (storage, _dir) = test_storage();
        let mut versioner = HistoryVersioner::<AccountResourceBalance>::new(&storage);

        versioner.add_slice(key(), |prev| add(prev, 5), 4).unwrap();
        versioner.add_slice(key(), |prev| add(prev, 1), 4).unwrap();

        let mut tx = storage.begin();
        assert_eq!(versioner.flush(&mut tx).unwrap(), 1);
        tx.commit().unwrap();

        let open = storage.get_open_history::<AccountResourceBalance>(&key()).unwrap().unwrap();
        assert_eq!(open.value, balance(6));
    }

    #[test]
    fn test_going_backwards_is_rejected() {
        let (storage, _dir) = test_storage();
        let mut versioner = HistoryVersioner::<ValidatorStakeSnapshot>::new(&storage);
        let snapshot = |_: Option<&ValidatorStakeSnapshot>| ValidatorStakeSnapshot {
            total_stake: TokenAmount::zero(),
        };

        versioner.add_slice("validator".to_string(), snapshot, 9).unwrap();
        let result = versioner.add_slice("validator".to_string(), snapshot, 8);
        assert!(matches!(result, Err(Error::InconsistentLedger(_))));
    }
}
