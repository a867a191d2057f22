//! Substate up/down application
//!
//! A [`SubstateLedger`] applies the operations of one batch. Changes are
//! kept in flight until [`SubstateLedger::flush`] stages them into a storage
//! transaction; every lookup checks in-flight entries before durable
//! storage, since a batch may up and down the same identifier.

use crate::error::{Error, Result};
use crate::storage::{Storage, StorageTransaction};
use crate::types::{
    OperationProvenance, Substate, SubstateContent, SubstateId, TransactionOpLocator,
};
use std::collections::HashMap;
use std::fmt;

/// Decides which identifiers may be downed without a prior up
pub trait VirtualIdentifierRecognizer: Send + Sync {
    /// Whether `identifier` is virtual
    fn is_virtual(&self, identifier: &SubstateId) -> bool;
}

/// No identifier is virtual
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVirtualSubstates;

impl VirtualIdentifierRecognizer for NoVirtualSubstates {
    fn is_virtual(&self, _identifier: &SubstateId) -> bool {
        false
    }
}

/// Identifiers starting with a fixed byte prefix are virtual
#[derive(Debug, Clone)]
pub struct PrefixVirtualRecognizer {
    prefix: Vec<u8>,
}

impl PrefixVirtualRecognizer {
    /// Recognize identifiers starting with `prefix`
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl VirtualIdentifierRecognizer for PrefixVirtualRecognizer {
    fn is_virtual(&self, identifier: &SubstateId) -> bool {
        identifier.as_bytes().starts_with(&self.prefix)
    }
}

/// Counts of applied operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubstateStats {
    /// Substates brought up (including synthesized virtual ups)
    pub upped: usize,
    /// Substates brought down
    pub downed: usize,
}

/// Applies substate operations for one batch
pub struct SubstateLedger<'s> {
    storage: &'s Storage,
    recognizer: &'s dyn VirtualIdentifierRecognizer,
    in_flight: HashMap<SubstateId, Substate>,
    stats: SubstateStats,
}

impl fmt::Debug for SubstateLedger<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstateLedger")
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'s> SubstateLedger<'s> {
    /// Create a ledger reading through to `storage`
    pub fn new(storage: &'s Storage, recognizer: &'s dyn VirtualIdentifierRecognizer) -> Self {
        Self {
            storage,
            recognizer,
            in_flight: HashMap::new(),
            stats: SubstateStats::default(),
        }
    }

    /// Substate for `identifier`, in-flight first
    pub fn get(&self, identifier: &SubstateId) -> Result<Option<Substate>> {
        match self.in_flight.get(identifier) {
            Some(substate) => Ok(Some(substate.clone())),
            None => self.storage.get_substate(identifier),
        }
    }

    /// Creates the substate. Fails if any entry for `identifier` exists.
    pub fn up<F>(
        &mut self,
        identifier: SubstateId,
        factory: F,
        provenance: OperationProvenance,
        locator: &TransactionOpLocator,
    ) -> Result<()>
    where
        F: FnOnce() -> SubstateContent,
    {
        if let Some(existing) = self.get(&identifier)? {
            return Err(Error::invalid_transaction(
                locator.clone(),
                format!(
                    "{} substate {} could not be upped as it already exists{}",
                    existing.content.kind(),
                    identifier,
                    if existing.is_down() { " (and is down)" } else { "" }
                ),
            ));
        }

        let substate = Substate {
            identifier: identifier.clone(),
            content: factory(),
            up: provenance,
            down: None,
        };
        tracing::trace!(substate = %identifier, kind = %substate.content.kind(), "Substate up");
        self.in_flight.insert(identifier, substate);
        self.stats.upped += 1;
        Ok(())
    }

    /// Spends the substate.
    ///
    /// A missing virtual identifier is synthesized via `virtual_factory` and goes up
    /// and down under the same provenance. `content_verifier` must accept the existing
    /// substate otherwise.
    pub fn down<F, V>(
        &mut self,
        identifier: SubstateId,
        virtual_factory: F,
        content_verifier: V,
        provenance: OperationProvenance,
        locator: &TransactionOpLocator,
    ) -> Result<()>
    where
        F: FnOnce() -> SubstateContent,
        V: FnOnce(&Substate) -> bool,
    {
        let substate = match self.get(&identifier)? {
            None if self.recognizer.is_virtual(&identifier) => {
                self.stats.upped += 1;
                Substate {
                    identifier: identifier.clone(),
                    content: virtual_factory(),
                    up: provenance,
                    down: Some(provenance),
                }
            }
            None => {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "substate {} could not be downed as it does not exist and is not virtual",
                        identifier
                    ),
                ));
            }
            Some(existing) if existing.is_down() => {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "{} substate {} could not be downed as it was already down",
                        existing.content.kind(),
                        identifier
                    ),
                ));
            }
            Some(existing) => {
                if !content_verifier(&existing) {
                    return Err(Error::invalid_transaction(
                        locator.clone(),
                        format!(
                            "{} substate {} could not be downed as the substate contents appear not to match at downing time",
                            existing.content.kind(),
                            identifier
                        ),
                    ));
                }
                Substate {
                    down: Some(provenance),
                    ..existing
                }
            }
        };

        tracing::trace!(substate = %identifier, kind = %substate.content.kind(), "Substate down");
        self.in_flight.insert(identifier, substate);
        self.stats.downed += 1;
        Ok(())
    }

    /// Spends the substate the node describes as `expected`.
    ///
    /// The expected content doubles as the virtual factory and the content check.
    pub fn down_expecting(
        &mut self,
        identifier: SubstateId,
        expected: &SubstateContent,
        provenance: OperationProvenance,
        locator: &TransactionOpLocator,
    ) -> Result<()> {
        if let Some(existing) = self.get(&identifier)? {
            let (actual, wanted) = (existing.content.kind(), expected.kind());
            if actual != wanted {
                return Err(Error::invalid_transaction(
                    locator.clone(),
                    format!(
                        "substate {} is a {} substate but was downed as {}",
                        identifier, actual, wanted
                    ),
                ));
            }
        }

        self.down(
            identifier,
            || expected.clone(),
            |existing| &existing.content == expected,
            provenance,
            locator,
        )
    }

    /// Operation counts so far
    pub fn stats(&self) -> SubstateStats {
        self.stats
    }

    /// Stages every changed substate into `tx`
    pub fn flush(self, tx: &mut StorageTransaction<'_>) -> Result<SubstateStats> {
        for substate in self.in_flight.values() {
            tx.put_substate(substate)?;
        }
        Ok(self.stats)
    }
}
