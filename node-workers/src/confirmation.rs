//! Quorum confirmation
//!
//! Node workers hand their fetched transactions to the
//! [`LedgerConfirmationService`] instead of committing them. The ledger
//! extension loop then walks forward from the top of ledger and, for each
//! state version, groups the nodes' transactions by accumulator. A
//! transaction is only committed once the trust weight of the nodes agreeing
//! on it reaches the quorum requirement. Nodes outvoted at a version are
//! marked inconsistent with the quorum.

use crate::config::{ConfirmationConfig, NodeConfig};
use crate::metrics::{ConfirmationMetrics, MetricStatus};
use crate::{Error, Result};
use gateway_ledger_core::accumulator::{self, Hash32};
use gateway_ledger_core::{
    CommitReport, CommittedTransaction, LedgerHandle, StateVersion, TopOfLedger,
    TransactionOpLocator,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Quorum accumulators kept for checking node tips behind the top of ledger
const QUORUM_ACCUMULATOR_CACHE_SIZE: usize = 2000;

/// Range of state versions a node should fetch next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionsRequested {
    /// Fetch transactions after this state version
    pub state_version_exclusive_lower_bound: StateVersion,
    /// Up to and including this state version
    pub state_version_inclusive_upper_bound: StateVersion,
}

impl TransactionsRequested {
    /// Number of transactions in the range
    pub fn len(&self) -> u64 {
        self.state_version_inclusive_upper_bound - self.state_version_exclusive_lower_bound
    }

    /// Whether the range is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct TrustRequirements {
    available_across_all_nodes: u64,
    of_sufficiently_synced_nodes: u64,
    required_now: f64,
    required_if_all_synced: f64,
}

struct TransactionClaim<'a> {
    transaction: &'a CommittedTransaction,
    node_names: Vec<String>,
    trust: u64,
}

struct MostTrusted<'a> {
    best: Option<TransactionClaim<'a>>,
    trust_committed_by_nodes: u64,
    inconsistent_node_names: Vec<String>,
}

#[derive(Debug, Default)]
struct ConfirmationState {
    known_top_of_ledger: Option<TopOfLedger>,
    latest_tip_by_node: HashMap<String, StateVersion>,
    transactions_by_node: HashMap<String, BTreeMap<StateVersion, CommittedTransaction>>,
    quorum_accumulators: BTreeMap<StateVersion, Hash32>,
    node_consistency: HashMap<String, MetricStatus>,
    quorum_exists: Option<MetricStatus>,
}

/// Decides when enough trusted nodes agree to extend the ledger
pub struct LedgerConfirmationService {
    ledger: LedgerHandle,
    trust_by_node: HashMap<String, u32>,
    config: ConfirmationConfig,
    metrics: ConfirmationMetrics,
    state: Mutex<ConfirmationState>,
}

impl std::fmt::Debug for LedgerConfirmationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConfirmationService")
            .field("nodes", &self.trust_by_node.len())
            .field("top_of_ledger", &self.known_state_version())
            .finish()
    }
}

impl LedgerConfirmationService {
    /// Create a service voting with the trust weights of `nodes`
    pub fn new(
        ledger: LedgerHandle,
        nodes: &[NodeConfig],
        config: ConfirmationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = ConfirmationMetrics::new()?;
        Ok(Self {
            ledger,
            trust_by_node: nodes
                .iter()
                .filter(|n| n.enabled)
                .map(|n| (n.name.clone(), n.trust_weight))
                .collect(),
            config,
            metrics,
            state: Mutex::new(ConfirmationState::default()),
        })
    }

    /// Prometheus collectors
    pub fn metrics(&self) -> &ConfirmationMetrics {
        &self.metrics
    }

    fn known_state_version(&self) -> Option<StateVersion> {
        self.state
            .lock()
            .known_top_of_ledger
            .as_ref()
            .map(|tip| tip.state_version)
    }

    /// Whether the node's ledger agrees with the committed quorum
    pub fn node_consistency(&self, node_name: &str) -> MetricStatus {
        self.state
            .lock()
            .node_consistency
            .get(node_name)
            .copied()
            .unwrap_or(MetricStatus::Unknown)
    }

    /// Whether enough nodes agree to keep committing
    pub fn quorum_exists(&self) -> MetricStatus {
        self.state.lock().quorum_exists.unwrap_or(MetricStatus::Unknown)
    }

    fn set_node_consistency(
        &self,
        state: &mut ConfirmationState,
        node_name: &str,
        status: MetricStatus,
    ) {
        state.node_consistency.insert(node_name.to_string(), status);
        self.metrics
            .node_consistent_with_quorum
            .with_label_values(&[node_name])
            .set(status.value());
    }

    fn set_quorum_exists(&self, state: &mut ConfirmationState, status: MetricStatus) {
        state.quorum_exists = Some(status);
        self.metrics.quorum_exists.set(status.value());
    }

    /// Record the highest point of the node's ledger seen so far.
    ///
    /// Tips at or below the top of ledger are checked against the quorum's
    /// accumulators; tips ahead of it are judged when the ledger extends.
    pub fn submit_node_network_status(
        &self,
        node_name: &str,
        tip_state_version: StateVersion,
        tip_accumulator: &Hash32,
    ) {
        let mut state = self.state.lock();
        let tip = state
            .latest_tip_by_node
            .entry(node_name.to_string())
            .or_insert(0);
        *tip = (*tip).max(tip_state_version);
        self.metrics
            .node_tip_state_version
            .with_label_values(&[node_name])
            .set(*tip as i64);

        let Some(known) = state.known_top_of_ledger.as_ref() else {
            return;
        };
        if tip_state_version > known.state_version {
            return;
        }

        let status = match state.quorum_accumulators.get(&tip_state_version) {
            None => MetricStatus::Unknown,
            Some(quorum) if quorum == tip_accumulator => MetricStatus::Yes,
            Some(_) => MetricStatus::No,
        };
        self.set_node_consistency(&mut state, node_name, status);
    }

    /// Hold `transactions` from `node_name` until the quorum decides on them.
    ///
    /// Each transaction must continue the node's own chain, or the quorum's
    /// where the node has nothing held at the parent. A node breaking its own
    /// chain has everything it submitted dropped.
    pub fn submit_transactions(
        &self,
        node_name: &str,
        transactions: Vec<CommittedTransaction>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let known_state_version = state
            .known_top_of_ledger
            .as_ref()
            .map_or(0, |tip| tip.state_version);

        for transaction in transactions {
            if transaction.state_version <= known_state_version {
                continue;
            }

            if let Err(e) = Self::check_continues_node_chain(&state, node_name, &transaction) {
                state.transactions_by_node.remove(node_name);
                return Err(e);
            }

            state
                .transactions_by_node
                .entry(node_name.to_string())
                .or_default()
                .insert(transaction.state_version, transaction);
        }
        Ok(())
    }

    fn check_continues_node_chain(
        state: &ConfirmationState,
        node_name: &str,
        transaction: &CommittedTransaction,
    ) -> Result<()> {
        let locator = TransactionOpLocator::transaction(transaction);
        if transaction.state_version != transaction.parent_state_version + 1 {
            return Err(gateway_ledger_core::Error::invalid_transaction(
                locator,
                format!(
                    "state version {} does not directly follow its parent {}",
                    transaction.state_version, transaction.parent_state_version
                ),
            )
            .into());
        }

        let parent = transaction.parent_state_version;
        let parent_accumulator = state
            .transactions_by_node
            .get(node_name)
            .and_then(|held| held.get(&parent))
            .map(|t| t.accumulator)
            .or_else(|| {
                state
                    .known_top_of_ledger
                    .as_ref()
                    .filter(|tip| tip.state_version == parent)
                    .map(|tip| tip.accumulator)
            })
            .or_else(|| state.quorum_accumulators.get(&parent).copied());

        let Some(parent_accumulator) = parent_accumulator else {
            return Ok(());
        };
        if !accumulator::is_valid_continuation(
            &parent_accumulator,
            &transaction.transaction_identifier,
            &transaction.accumulator,
        )? {
            return Err(gateway_ledger_core::Error::invalid_transaction(
                locator,
                format!(
                    "accumulator {} does not continue parent accumulator {}",
                    hex::encode(transaction.accumulator),
                    hex::encode(parent_accumulator)
                ),
            )
            .into());
        }
        Ok(())
    }

    /// Which transactions the node should fetch next.
    ///
    /// `None` until the top of ledger is known, or while the node's pipeline
    /// ahead of it is full.
    pub fn requested_range(&self, node_name: &str) -> Option<TransactionsRequested> {
        let state = self.state.lock();
        let top = state.known_top_of_ledger.as_ref()?.state_version;
        let upper = top + self.config.max_transaction_pipeline_size_per_node;

        let held = state.transactions_by_node.get(node_name);
        let first_gap = (top + 1..=upper).find(|v| !held.is_some_and(|h| h.contains_key(v)))?;

        Some(TransactionsRequested {
            state_version_exclusive_lower_bound: first_gap - 1,
            state_version_inclusive_upper_bound: upper,
        })
    }

    /// Commit the longest run after the top of ledger that a quorum agrees on.
    ///
    /// Returns `None` when there is nothing to commit yet. Must only be driven
    /// from a single loop.
    pub async fn handle_ledger_extension_if_quorum(&self) -> Result<Option<CommitReport>> {
        let tip = self.ledger.top_of_ledger().await?;
        self.state.lock().known_top_of_ledger = Some(tip.clone());

        let extension = self.construct_quorum_extension(&tip);
        if extension.is_empty() {
            return Ok(None);
        }

        let report = match self.ledger.commit_batch(extension.clone()).await {
            Ok(report) => report,
            Err(e) if e.is_invalid_transaction() => {
                self.metrics
                    .quorum_extension_consistent
                    .set(MetricStatus::No.value());
                warn!(error = %e, "Ledger rejected the quorum's extension");
                return Err(Error::QuorumRejected(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.metrics
            .quorum_extension_consistent
            .set(MetricStatus::Yes.value());

        let mut state = self.state.lock();
        for transaction in &extension {
            state
                .quorum_accumulators
                .insert(transaction.state_version, transaction.accumulator);
        }
        while state.quorum_accumulators.len() > QUORUM_ACCUMULATOR_CACHE_SIZE {
            state.quorum_accumulators.pop_first();
        }

        let committed_to = report.top_of_ledger.state_version;
        state.known_top_of_ledger = Some(report.top_of_ledger.clone());
        for held in state.transactions_by_node.values_mut() {
            held.retain(|state_version, _| *state_version > committed_to);
        }

        Ok(Some(report))
    }

    fn construct_quorum_extension(&self, tip: &TopOfLedger) -> Vec<CommittedTransaction> {
        let mut state = self.state.lock();
        let requirements = self.trust_requirements(&state, tip.state_version);

        if requirements.available_across_all_nodes == 0 {
            warn!("Total trust weighting across all nodes is zero, no nodes are ingesting");
            return Vec::new();
        }
        if requirements.required_now == 0.0 {
            debug!("No node is sufficiently synced up to form a quorum yet");
            return Vec::new();
        }

        let mut extension = Vec::new();
        let mut outcomes = Vec::new();
        let mut quorum_status = None;

        let start = tip.state_version + 1;
        for state_version in start..start + self.config.max_commit_batch_size {
            let report = Self::find_most_trusted(&state, &self.trust_by_node, state_version);

            if let Some(best) = report
                .best
                .as_ref()
                .filter(|best| best.trust as f64 >= requirements.required_now)
            {
                outcomes.push((best.node_names.clone(), report.inconsistent_node_names.clone()));
                extension.push(best.transaction.clone());
                continue;
            }

            let best_trust = report.best.as_ref().map_or(0, |b| b.trust);
            let remaining_from_synced = requirements
                .of_sufficiently_synced_nodes
                .saturating_sub(report.trust_committed_by_nodes);
            if ((best_trust + remaining_from_synced) as f64) < requirements.required_now {
                quorum_status = Some(MetricStatus::Unknown);
            }
            let remaining_from_all = requirements
                .available_across_all_nodes
                .saturating_sub(report.trust_committed_by_nodes);
            if ((best_trust + remaining_from_all) as f64) < requirements.required_if_all_synced {
                warn!(
                    state_version,
                    "No quorum is possible even with every node synced up"
                );
                quorum_status = Some(MetricStatus::No);
            }
            break;
        }

        for (consistent, inconsistent) in outcomes {
            for node in inconsistent {
                self.set_node_consistency(&mut state, &node, MetricStatus::No);
            }
            for node in consistent {
                self.set_node_consistency(&mut state, &node, MetricStatus::Yes);
            }
        }
        if !extension.is_empty() {
            quorum_status = Some(MetricStatus::Yes);
        }
        if let Some(status) = quorum_status {
            self.set_quorum_exists(&mut state, status);
        }

        extension
    }

    fn find_most_trusted<'a>(
        state: &'a ConfirmationState,
        trust_by_node: &HashMap<String, u32>,
        state_version: StateVersion,
    ) -> MostTrusted<'a> {
        let mut claims: BTreeMap<Hash32, TransactionClaim<'a>> = BTreeMap::new();
        for (node_name, held) in &state.transactions_by_node {
            let Some(transaction) = held.get(&state_version) else {
                continue;
            };
            let trust = u64::from(trust_by_node.get(node_name).copied().unwrap_or(0));
            let claim = claims
                .entry(transaction.accumulator)
                .or_insert_with(|| TransactionClaim {
                    transaction,
                    node_names: Vec::new(),
                    trust: 0,
                });
            claim.node_names.push(node_name.clone());
            claim.trust += trust;
        }

        let trust_committed_by_nodes = claims.values().map(|c| c.trust).sum();
        let mut ordered: Vec<TransactionClaim<'a>> = claims.into_values().collect();
        ordered.sort_by(|a, b| b.trust.cmp(&a.trust));

        let mut ordered = ordered.into_iter();
        let best = ordered.next();
        let inconsistent_node_names = ordered.flat_map(|c| c.node_names).collect();

        MostTrusted {
            best,
            trust_committed_by_nodes,
            inconsistent_node_names,
        }
    }

    fn trust_requirements(
        &self,
        state: &ConfirmationState,
        top: StateVersion,
    ) -> TrustRequirements {
        let threshold = self.config.sufficiently_synced_state_version_threshold;
        let is_synced = |node_name: &str| {
            state
                .latest_tip_by_node
                .get(node_name)
                .is_some_and(|tip| *tip != 0 && tip + threshold > top)
        };

        let mut synced_count = 0;
        let mut of_sufficiently_synced_nodes = 0;
        let mut available_across_all_nodes = 0;
        for (node_name, trust) in &self.trust_by_node {
            let trust = u64::from(*trust);
            available_across_all_nodes += trust;
            if is_synced(node_name) {
                synced_count += 1;
                of_sufficiently_synced_nodes += trust;
            }
        }

        let proportion = self.config.quorum_requires_trust_proportion;
        let only_synced = self.config.only_use_sufficiently_synced_up_nodes_for_quorum_calculation;
        let used_for_quorum = if only_synced {
            of_sufficiently_synced_nodes
        } else {
            available_across_all_nodes
        };
        let requirements = TrustRequirements {
            available_across_all_nodes,
            of_sufficiently_synced_nodes,
            required_now: proportion * used_for_quorum as f64,
            required_if_all_synced: proportion * available_across_all_nodes as f64,
        };

        self.metrics.synced_nodes.set(synced_count);
        self.metrics.synced_nodes_trust.set(of_sufficiently_synced_nodes as f64);
        self.metrics.configured_nodes.set(self.trust_by_node.len() as i64);
        self.metrics.configured_nodes_trust.set(available_across_all_nodes as f64);
        self.metrics.trust_required.set(requirements.required_now);
        self.metrics
            .trust_required_if_all_synced
            .set(requirements.required_if_all_synced);

        requirements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gateway_ledger_core::accumulator::PRE_GENESIS_ACCUMULATOR;
    use gateway_ledger_core::{Ledger, TokenAmount};
    use tempfile::TempDir;

    fn node(name: &str, trust_weight: u32) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            core_api_url: format!("http://{}", name),
            enabled: true,
            request_timeout_ms: 1000,
            trust_weight,
        }
    }

    fn chain(count: u64, seed: u8) -> Vec<CommittedTransaction> {
        let mut parent: Hash32 = PRE_GENESIS_ACCUMULATOR;
        (1..=count)
            .map(|state_version| {
                let mut identifier = [state_version as u8; 32];
                identifier[0] = seed;
                let next = accumulator::compute_next(&parent, &identifier).unwrap();
                parent = next;
                CommittedTransaction {
                    state_version,
                    parent_state_version: state_version - 1,
                    transaction_identifier: identifier,
                    accumulator: next,
                    payload: None,
                    fee_paid: TokenAmount::zero(),
                    round_in_epoch: state_version,
                    ends_epoch: false,
                    timestamp: Utc::now(),
                    operation_groups: Vec::new(),
                }
            })
            .collect()
    }

    async fn open_ledger() -> (Ledger, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = gateway_ledger_core::Config {
            data_dir: temp.path().to_path_buf(),
            ..Default::default()
        };
        (Ledger::open(config).await.unwrap(), temp)
    }

    fn service(ledger: &Ledger, nodes: &[NodeConfig]) -> LedgerConfirmationService {
        LedgerConfirmationService::new(ledger.handle(), nodes, ConfirmationConfig::default()).unwrap()
    }

    fn submit(
        service: &LedgerConfirmationService,
        node: &str,
        transactions: Vec<CommittedTransaction>,
    ) {
        if let Some(last) = transactions.last() {
            service.submit_node_network_status(node, last.state_version, &last.accumulator);
        }
        service.submit_transactions(node, transactions).unwrap();
    }

    #[tokio::test]
    async fn test_honest_majority_outvotes_forger() {
        let (ledger, _temp) = open_ledger().await;
        let nodes = [node("honest-a", 1), node("honest-b", 1), node("forger", 1)];
        let service = service(&ledger, &nodes);

        assert!(service.requested_range("honest-a").is_none());
        assert!(service.handle_ledger_extension_if_quorum().await.unwrap().is_none());
        assert_eq!(
            service.requested_range("honest-a").unwrap().state_version_exclusive_lower_bound,
            0
        );

        let honest = chain(3, 0xaa);
        submit(&service, "forger", chain(3, 0xff));
        submit(&service, "honest-a", honest.clone());

        // One honest vote against one forged vote is not a quorum
        assert!(service.handle_ledger_extension_if_quorum().await.unwrap().is_none());
        assert_eq!(ledger.top_of_ledger().unwrap().state_version, 0);

        submit(&service, "honest-b", honest.clone());
        let report = service.handle_ledger_extension_if_quorum().await.unwrap().unwrap();
        assert_eq!(report.transactions_committed, 3);

        let tip = ledger.top_of_ledger().unwrap();
        assert_eq!(tip.state_version, 3);
        assert_eq!(tip.accumulator, honest[2].accumulator);

        assert_eq!(service.node_consistency("honest-a"), MetricStatus::Yes);
        assert_eq!(service.node_consistency("honest-b"), MetricStatus::Yes);
        assert_eq!(service.node_consistency("forger"), MetricStatus::No);
        assert_eq!(service.quorum_exists(), MetricStatus::Yes);

        // Committed transactions are released and nodes are asked for the next run
        assert_eq!(
            service.requested_range("forger").unwrap().state_version_exclusive_lower_bound,
            3
        );

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_trust_weight_decides_quorum() {
        let (ledger, _temp) = open_ledger().await;
        let nodes = [node("trusted", 3), node("other-a", 1), node("other-b", 1)];
        let service = service(&ledger, &nodes);
        service.handle_ledger_extension_if_quorum().await.unwrap();

        let trusted = chain(2, 0x01);
        submit(&service, "trusted", trusted.clone());
        submit(&service, "other-a", chain(2, 0x02));
        submit(&service, "other-b", chain(2, 0x02));

        service.handle_ledger_extension_if_quorum().await.unwrap().unwrap();
        assert_eq!(ledger.top_of_ledger().unwrap().accumulator, trusted[1].accumulator);
        assert_eq!(service.node_consistency("other-a"), MetricStatus::No);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_split_vote_reports_no_quorum() {
        let (ledger, _temp) = open_ledger().await;
        let nodes = [node("a", 1), node("b", 1)];
        let service = service(&ledger, &nodes);
        service.handle_ledger_extension_if_quorum().await.unwrap();

        submit(&service, "a", chain(1, 0x0a));
        submit(&service, "b", chain(1, 0x0b));

        assert!(service.handle_ledger_extension_if_quorum().await.unwrap().is_none());
        assert_eq!(service.quorum_exists(), MetricStatus::No);
        assert_eq!(service.metrics().quorum_exists.get(), 0.0);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_node_chain_is_rejected() {
        let (ledger, _temp) = open_ledger().await;
        let service = service(&ledger, &[node("a", 1)]);
        service.handle_ledger_extension_if_quorum().await.unwrap();

        let mut transactions = chain(2, 0x0a);
        transactions[1].accumulator = [0xee; 32];

        let err = service.submit_transactions("a", transactions).unwrap_err();
        assert!(err.is_invalid_transaction(), "{}", err);
        assert_eq!(
            service.requested_range("a").unwrap().state_version_exclusive_lower_bound,
            0
        );

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_tip_checked_against_quorum() {
        let (ledger, _temp) = open_ledger().await;
        let service = service(&ledger, &[node("a", 1)]);
        service.handle_ledger_extension_if_quorum().await.unwrap();

        let transactions = chain(2, 0x0a);
        submit(&service, "a", transactions.clone());
        service.handle_ledger_extension_if_quorum().await.unwrap().unwrap();

        service.submit_node_network_status("late", 1, &transactions[0].accumulator);
        assert_eq!(service.node_consistency("late"), MetricStatus::Yes);
        service.submit_node_network_status("wrong", 2, &[0x01; 32]);
        assert_eq!(service.node_consistency("wrong"), MetricStatus::No);

        ledger.shutdown().await.unwrap();
    }
}
