//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `transactions` - Committed transactions (key: state_version, big-endian)
//! - `transaction_ids` - Identifier index (key: identifier hash, value: state_version)
//! - `substates` - Substates with up/down provenance (key: substate identifier)
//! - `history` - Aggregate history slices (key: kind || entity key || from_state_version)
//! - `history_open` - Open slice index (key: kind || entity key, value: from_state_version)
//! - `mempool` - Tracked submissions (key: identifier hash)
//! - `meta` - Top of ledger
//!
//! Reads go straight to durable state. Writes are staged in a
//! [`StorageTransaction`] and land atomically on [`StorageTransaction::commit`].

use crate::{
    accumulator::{self, Hash32, PRE_GENESIS_ACCUMULATOR},
    error::{Error, Result},
    history::{HistoryAggregate, HistorySlice},
    mempool::MempoolTransaction,
    types::{LedgerTransaction, StateVersion, Substate, SubstateId, TopOfLedger},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// Column family names
const CF_TRANSACTIONS: &str = "transactions";
const CF_TRANSACTION_IDS: &str = "transaction_ids";
const CF_SUBSTATES: &str = "substates";
const CF_HISTORY: &str = "history";
const CF_HISTORY_OPEN: &str = "history_open";
const CF_MEMPOOL: &str = "mempool";
const CF_META: &str = "meta";

const KEY_TOP_OF_LEDGER: &[u8] = b"top_of_ledger";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Append-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_TRANSACTION_IDS, Self::cf_options_point_lookup()),
            ColumnFamilyDescriptor::new(CF_SUBSTATES, Self::cf_options_point_lookup()),
            ColumnFamilyDescriptor::new(CF_HISTORY, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_HISTORY_OPEN, Self::cf_options_point_lookup()),
            ColumnFamilyDescriptor::new(CF_MEMPOOL, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_point_lookup() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_decoded<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Begin a unit of work. Dropping it without committing discards every staged write.
    pub fn begin(&self) -> StorageTransaction<'_> {
        StorageTransaction {
            storage: self,
            batch: WriteBatch::default(),
            committed: false,
        }
    }

    // Ledger tip

    /// Stored tip, `None` for an empty ledger
    pub fn get_top_of_ledger(&self) -> Result<Option<TopOfLedger>> {
        self.get_decoded(CF_META, KEY_TOP_OF_LEDGER)
    }

    /// Stored tip, or the pre-genesis tip for an empty ledger
    pub fn top_of_ledger(&self) -> Result<TopOfLedger> {
        Ok(self.get_top_of_ledger()?.unwrap_or_else(TopOfLedger::pre_genesis))
    }

    // Transactions

    /// Get transaction by state version
    pub fn get_transaction(&self, state_version: StateVersion) -> Result<Option<LedgerTransaction>> {
        self.get_decoded(CF_TRANSACTIONS, &state_version.to_be_bytes())
    }

    /// Get transaction by identifier hash
    pub fn get_transaction_by_identifier(&self, identifier: &Hash32) -> Result<Option<LedgerTransaction>> {
        let cf = self.cf_handle(CF_TRANSACTION_IDS)?;
        let Some(value) = self.db.get_cf(cf, identifier)? else {
            return Ok(None);
        };
        let state_version = decode_state_version(&value)?;
        self.get_transaction(state_version)
    }

    // Substates

    /// Get substate by identifier
    pub fn get_substate(&self, identifier: &SubstateId) -> Result<Option<Substate>> {
        self.get_decoded(CF_SUBSTATES, identifier.as_bytes())
    }

    // History

    /// Currently open slice for `key`
    pub fn get_open_history<A: HistoryAggregate>(&self, key: &A::Key) -> Result<Option<HistorySlice<A>>> {
        let entity_key = history_entity_key::<A>(key)?;
        let cf_open = self.cf_handle(CF_HISTORY_OPEN)?;
        let Some(from) = self.db.get_cf(cf_open, &entity_key)? else {
            return Ok(None);
        };
        let from = decode_state_version(&from)?;
        let slice: Option<HistorySlice<A>> =
            self.get_decoded(CF_HISTORY, &history_slice_key(&entity_key, from))?;
        slice
            .map(Some)
            .ok_or_else(|| {
                Error::InconsistentLedger(format!(
                    "{:?} history for {:?} points at missing open slice from {}",
                    A::KIND,
                    key,
                    from
                ))
            })
    }

    /// All slices for `key`, oldest first
    pub fn get_history<A: HistoryAggregate>(&self, key: &A::Key) -> Result<Vec<HistorySlice<A>>> {
        let entity_key = history_entity_key::<A>(key)?;
        let cf = self.cf_handle(CF_HISTORY)?;

        let mut slices = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&entity_key, Direction::Forward));
        for item in iter {
            let (k, value) = item?;
            if !is_slice_of(&k, &entity_key) {
                break;
            }
            slices.push(bincode::deserialize(&value)?);
        }
        Ok(slices)
    }

    /// Slice of `key` covering `state_version`, if any
    pub fn get_history_at<A: HistoryAggregate>(
        &self,
        key: &A::Key,
        state_version: StateVersion,
    ) -> Result<Option<HistorySlice<A>>> {
        let entity_key = history_entity_key::<A>(key)?;
        let cf = self.cf_handle(CF_HISTORY)?;

        // Greatest slice starting at or before the requested version
        let seek = history_slice_key(&entity_key, state_version);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&seek, Direction::Reverse));
        let Some(item) = iter.next() else {
            return Ok(None);
        };
        let (k, value) = item?;
        if !is_slice_of(&k, &entity_key) {
            return Ok(None);
        }
        let slice: HistorySlice<A> = bincode::deserialize(&value)?;
        Ok(slice.contains(state_version).then_some(slice))
    }

    // Mempool

    /// Get tracked mempool transaction
    pub fn get_mempool_transaction(&self, identifier: &Hash32) -> Result<Option<MempoolTransaction>> {
        self.get_decoded(CF_MEMPOOL, identifier)
    }

    // Integrity

    /// Re-walks the accumulator chain over `from..=to`
    pub fn verify_chain(&self, from: StateVersion, to: StateVersion) -> Result<()> {
        let first = from.max(1);
        let mut parent_accumulator = if first == 1 {
            PRE_GENESIS_ACCUMULATOR
        } else {
            self.get_transaction(first - 1)?
                .ok_or_else(|| missing_transaction(first - 1))?
                .accumulator
        };

        for state_version in first..=to {
            let transaction = self
                .get_transaction(state_version)?
                .ok_or_else(|| missing_transaction(state_version))?;

            if transaction.parent_state_version != state_version - 1 {
                return Err(Error::InconsistentLedger(format!(
                    "transaction at {} records parent {}",
                    state_version, transaction.parent_state_version
                )));
            }

            if !accumulator::is_valid_continuation(
                &parent_accumulator,
                &transaction.transaction_identifier,
                &transaction.accumulator,
            )? {
                return Err(Error::InconsistentLedger(format!(
                    "accumulator chain broken at state version {}",
                    state_version
                )));
            }
            parent_accumulator = transaction.accumulator;
        }

        tracing::debug!(from, to, "Accumulator chain verified");
        Ok(())
    }

    /// Checks that the stored tip agrees with the transaction it points at
    pub fn verify_top_of_ledger(&self) -> Result<TopOfLedger> {
        let Some(tip) = self.get_top_of_ledger()? else {
            return Ok(TopOfLedger::pre_genesis());
        };

        let transaction = self
            .get_transaction(tip.state_version)?
            .ok_or_else(|| missing_transaction(tip.state_version))?;
        if transaction.accumulator != tip.accumulator {
            return Err(Error::InconsistentLedger(format!(
                "top of ledger accumulator disagrees with transaction {}",
                tip.state_version
            )));
        }
        if self.get_transaction(tip.state_version + 1)?.is_some() {
            return Err(Error::InconsistentLedger(format!(
                "transaction stored beyond top of ledger {}",
                tip.state_version
            )));
        }
        Ok(tip)
    }
}

/// Staged writes against [`Storage`], applied atomically.
pub struct StorageTransaction<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
    committed: bool,
}

impl fmt::Debug for StorageTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageTransaction")
            .field("staged", &self.batch.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl<'a> StorageTransaction<'a> {
    /// Stage a committed transaction and its identifier index
    pub fn put_transaction(&mut self, transaction: &LedgerTransaction) -> Result<()> {
        let key = transaction.state_version.to_be_bytes();
        let cf = self.storage.cf_handle(CF_TRANSACTIONS)?;
        self.batch.put_cf(cf, key, bincode::serialize(transaction)?);

        let cf_ids = self.storage.cf_handle(CF_TRANSACTION_IDS)?;
        self.batch.put_cf(cf_ids, transaction.transaction_identifier, key);
        Ok(())
    }

    /// Stage a substate
    pub fn put_substate(&mut self, substate: &Substate) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SUBSTATES)?;
        self.batch
            .put_cf(cf, substate.identifier.as_bytes(), bincode::serialize(substate)?);
        Ok(())
    }

    /// Stage a history slice; open slices also move the open index
    pub fn put_history_slice<A: HistoryAggregate>(&mut self, key: &A::Key, slice: &HistorySlice<A>) -> Result<()> {
        let entity_key = history_entity_key::<A>(key)?;
        let cf = self.storage.cf_handle(CF_HISTORY)?;
        self.batch.put_cf(
            cf,
            history_slice_key(&entity_key, slice.from_state_version),
            bincode::serialize(slice)?,
        );

        if slice.is_open() {
            let cf_open = self.storage.cf_handle(CF_HISTORY_OPEN)?;
            self.batch
                .put_cf(cf_open, &entity_key, slice.from_state_version.to_be_bytes());
        }
        Ok(())
    }

    /// Stage a mempool record
    pub fn put_mempool_transaction(&mut self, transaction: &MempoolTransaction) -> Result<()> {
        let cf = self.storage.cf_handle(CF_MEMPOOL)?;
        self.batch.put_cf(
            cf,
            transaction.transaction_identifier,
            bincode::serialize(transaction)?,
        );
        Ok(())
    }

    /// Stage the new tip
    pub fn put_top_of_ledger(&mut self, tip: &TopOfLedger) -> Result<()> {
        let cf = self.storage.cf_handle(CF_META)?;
        self.batch.put_cf(cf, KEY_TOP_OF_LEDGER, bincode::serialize(tip)?);
        Ok(())
    }

    /// Number of staged writes
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Apply all staged writes atomically
    pub fn commit(mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.batch);
        let staged = batch.len();
        self.storage.db.write(batch)?;
        self.committed = true;
        tracing::debug!(staged, "Storage transaction committed");
        Ok(())
    }
}

impl Drop for StorageTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.batch.is_empty() {
            tracing::debug!(staged = self.batch.len(), "Storage transaction rolled back");
        }
    }
}

// Key helpers

fn history_entity_key<A: HistoryAggregate>(key: &A::Key) -> Result<Vec<u8>> {
    let mut entity_key = vec![A::KIND as u8];
    entity_key.extend(bincode::serialize(key)?);
    Ok(entity_key)
}

fn history_slice_key(entity_key: &[u8], from_state_version: StateVersion) -> Vec<u8> {
    let mut key = entity_key.to_vec();
    key.extend_from_slice(&from_state_version.to_be_bytes());
    key
}

// bincode keys are length-prefixed, so a slice key is exactly entity key + 8 bytes
fn is_slice_of(slice_key: &[u8], entity_key: &[u8]) -> bool {
    slice_key.len() == entity_key.len() + 8 && slice_key.starts_with(entity_key)
}

fn decode_state_version(bytes: &[u8]) -> Result<StateVersion> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Invalid state version encoding ({} bytes)", bytes.len())))?;
    Ok(StateVersion::from_be_bytes(raw))
}

fn missing_transaction(state_version: StateVersion) -> Error {
    Error::InconsistentLedger(format!("transaction {} is missing", state_version))
}
