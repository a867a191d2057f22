//! Mempool transaction tracking
//!
//! Transactions submitted through the gateway are tracked until they show up
//! in a committed batch, at which point the commit pipeline marks them
//! [`MempoolTransactionStatus::Committed`].

use crate::accumulator::Hash32;
use crate::types::StateVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MempoolTransactionStatus {
    /// Accepted by at least one node's mempool
    InNodeMempool = 1,
    /// No node reports it any longer
    Missing = 2,
    /// Node says it was resolved but the ledger has not caught up yet
    ResolvedButUnknownTillSyncedUp = 3,
    /// Rejected or failed
    Failed = 4,
    /// Seen in a committed batch
    Committed = 5,
}

impl MempoolTransactionStatus {
    /// Whether no further transitions are expected
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Failed | Self::Committed)
    }
}

/// A tracked submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolTransaction {
    /// Transaction identifier hash
    pub transaction_identifier: Hash32,
    /// Raw payload as submitted
    pub payload: Vec<u8>,
    /// Current status
    pub status: MempoolTransactionStatus,
    /// First time the gateway saw it
    pub first_seen_at: DateTime<Utc>,
    /// Last status change
    pub last_status_change_at: DateTime<Utc>,
    /// Failure reason, when failed
    pub failure_reason: Option<String>,
    /// State version it committed at
    pub committed_state_version: Option<StateVersion>,
}

impl MempoolTransaction {
    /// A newly submitted transaction
    pub fn submitted(transaction_identifier: Hash32, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            transaction_identifier,
            payload,
            status: MempoolTransactionStatus::InNodeMempool,
            first_seen_at: now,
            last_status_change_at: now,
            failure_reason: None,
            committed_state_version: None,
        }
    }

    /// Move to `status`. Committed transactions never move again.
    pub fn set_status(&mut self, status: MempoolTransactionStatus, failure_reason: Option<String>) -> bool {
        if self.status == MempoolTransactionStatus::Committed || self.status == status {
            return false;
        }
        self.status = status;
        self.failure_reason = failure_reason;
        self.last_status_change_at = Utc::now();
        true
    }

    /// Record the commit
    pub fn mark_committed(&mut self, state_version: StateVersion) {
        self.status = MempoolTransactionStatus::Committed;
        self.committed_state_version = Some(state_version);
        self.failure_reason = None;
        self.last_status_change_at = Utc::now();
    }
}
