//! Supervisor lifecycle tests

use async_trait::async_trait;
use chrono::Utc;
use gateway_ledger_core::accumulator::{self, Hash32, PRE_GENESIS_ACCUMULATOR};
use gateway_ledger_core::{CommittedTransaction, Ledger, LedgerHandle, StateVersion, TokenAmount};
use gateway_node_workers::{
    ConfirmationConfig, DefaultFatalClassifier, Error, FetchConfig, GroupHealth, GroupStatus,
    LedgerConfirmationService, LedgerExtensionWorker, LoopedWorker, MetricStatus, NodeConfig,
    NodeContext, NodeContextFactory, NodeTransactionSource, NodeWorkerSupervisor, Result,
    WorkerState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum Behaviour {
    Serve(Vec<CommittedTransaction>),
    Unreachable,
}

struct FakeSource {
    behaviour: Behaviour,
}

#[async_trait]
impl NodeTransactionSource for FakeSource {
    async fn network_identity(&self) -> Result<String> {
        match self.behaviour {
            Behaviour::Serve(_) => Ok("mainnet".to_string()),
            Behaviour::Unreachable => Err(Error::NodeApi {
                node: "fake".to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn fetch(&self, after: StateVersion, max_count: usize) -> Result<Vec<CommittedTransaction>> {
        match &self.behaviour {
            Behaviour::Serve(transactions) => Ok(transactions
                .iter()
                .filter(|tx| tx.state_version > after)
                .take(max_count)
                .cloned()
                .collect()),
            Behaviour::Unreachable => Err(Error::NodeApi {
                node: "fake".to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

#[derive(Clone)]
enum Script {
    Serve(Vec<CommittedTransaction>),
    Unreachable,
    FatalFactory,
}

struct FakeFactory {
    confirmation: Arc<LedgerConfirmationService>,
    scripts: HashMap<String, Script>,
    attempts: AtomicU32,
}

impl FakeFactory {
    fn new(confirmation: Arc<LedgerConfirmationService>, scripts: Vec<(&str, Script)>) -> Self {
        Self {
            confirmation,
            scripts: scripts
                .into_iter()
                .map(|(name, script)| (name.to_string(), script))
                .collect(),
            attempts: AtomicU32::new(0),
        }
    }
}

impl NodeContextFactory for FakeFactory {
    fn create(&self, node: &NodeConfig) -> Result<NodeContext> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let behaviour = match self.scripts.get(&node.name).cloned() {
            Some(Script::Serve(transactions)) => Behaviour::Serve(transactions),
            Some(Script::Unreachable) | None => Behaviour::Unreachable,
            Some(Script::FatalFactory) => {
                return Err(Error::AppFatal("node secrets unreadable".to_string()))
            }
        };

        Ok(NodeContext {
            node: node.clone(),
            source: Arc::new(FakeSource { behaviour }),
            confirmation: self.confirmation.clone(),
            expected_network: "mainnet".to_string(),
            fetch: FetchConfig::default(),
        })
    }
}

fn node(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        core_api_url: format!("http://{}:3333", name),
        enabled: true,
        request_timeout_ms: 1000,
        trust_weight: 1,
    }
}

fn detached_ledger() -> LedgerHandle {
    let (sender, _receiver) = mpsc::channel(1);
    LedgerHandle::new(sender)
}

fn confirmation(ledger: LedgerHandle, nodes: &[NodeConfig]) -> Arc<LedgerConfirmationService> {
    Arc::new(LedgerConfirmationService::new(ledger, nodes, ConfirmationConfig::default()).unwrap())
}

fn spawn_extension(
    confirmation: Arc<LedgerConfirmationService>,
    cancel: &CancellationToken,
) -> LoopedWorker {
    let delay = ConfirmationConfig::default().delay_between_loops().unwrap();
    LoopedWorker::spawn(
        Arc::new(LedgerExtensionWorker::new(confirmation, delay)),
        Arc::new(DefaultFatalClassifier),
        cancel.clone(),
    )
}

async fn wait_for_state_version(ledger: &Ledger, state_version: u64) {
    for _ in 0..100 {
        if ledger.top_of_ledger().unwrap().state_version == state_version {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn open_ledger() -> (Ledger, TempDir) {
    let temp = TempDir::new().unwrap();
    let config = gateway_ledger_core::Config {
        data_dir: temp.path().to_path_buf(),
        ..Default::default()
    };
    (Ledger::open(config).await.unwrap(), temp)
}

fn chain(count: u64) -> Vec<CommittedTransaction> {
    chain_with_seed(count, 0)
}

fn chain_with_seed(count: u64, seed: u8) -> Vec<CommittedTransaction> {
    let mut parent: Hash32 = PRE_GENESIS_ACCUMULATOR;
    (1..=count)
        .map(|state_version| {
            let mut identifier = [state_version as u8; 32];
            identifier[31] ^= seed;
            let next = accumulator::compute_next(&parent, &identifier).unwrap();
            let tx = CommittedTransaction {
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
            };
            parent = next;
            tx
        })
        .collect()
}

fn supervisor(factory: Arc<FakeFactory>) -> NodeWorkerSupervisor {
    NodeWorkerSupervisor::new(
        factory,
        Arc::new(DefaultFatalClassifier),
        Duration::from_secs(20),
    )
}

#[tokio::test(start_paused = true)]
async fn test_failed_node_is_blocklisted_for_cool_down() {
    let nodes = vec![node("node-a")];
    let factory = Arc::new(FakeFactory::new(
        confirmation(detached_ledger(), &nodes),
        vec![("node-a", Script::Unreachable)],
    ));
    let supervisor = supervisor(factory.clone());

    supervisor.reconcile(&nodes).await.unwrap();
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
    assert!(supervisor.is_blocklisted("node-a"));
    assert!(supervisor.snapshot().is_empty());

    tokio::time::advance(Duration::from_secs(10)).await;
    supervisor.reconcile(&nodes).await.unwrap();
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(!supervisor.is_blocklisted("node-a"));
    supervisor.reconcile(&nodes).await.unwrap();
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fatal_start_failure_propagates() {
    let factory = Arc::new(FakeFactory::new(
        confirmation(detached_ledger(), &[node("node-a")]),
        vec![("node-a", Script::FatalFactory)],
    ));
    let supervisor = supervisor(factory);

    let err = supervisor.reconcile(&[node("node-a")]).await.unwrap_err();
    assert!(matches!(err, Error::AppFatal(_)), "{}", err);
    assert!(!supervisor.is_blocklisted("node-a"));
}

#[tokio::test]
async fn test_ingests_then_stops_disabled_node() {
    let (ledger, _temp) = open_ledger().await;
    let nodes = vec![node("node-a"), node("node-b")];
    let confirmation = confirmation(ledger.handle(), &nodes);
    let cancel = CancellationToken::new();
    let extension = spawn_extension(confirmation.clone(), &cancel);
    let factory = Arc::new(FakeFactory::new(
        confirmation,
        vec![("node-a", Script::Serve(chain(3))), ("node-b", Script::Serve(chain(3)))],
    ));
    let supervisor = supervisor(factory);

    supervisor.reconcile(&nodes).await.unwrap();
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot
        .iter()
        .all(|s| s.status == GroupStatus::Running && s.health == GroupHealth::Healthy));

    wait_for_state_version(&ledger, 3).await;
    assert_eq!(ledger.top_of_ledger().unwrap().state_version, 3);

    supervisor.reconcile(&nodes[..1]).await.unwrap();
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].node, "node-a");
    assert_eq!(snapshot[0].health, GroupHealth::Healthy);
    assert!(!supervisor.is_blocklisted("node-b"));

    supervisor.stop_all().await;
    supervisor.stop_all().await;
    assert!(supervisor.snapshot().is_empty());

    cancel.cancel();
    extension.join().await;
    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_transaction_makes_group_unhealthy() {
    let (ledger, _temp) = open_ledger().await;
    let mut transactions = chain(2);
    transactions[1].accumulator = [0xee; 32];

    let nodes = vec![node("node-a")];
    let confirmation = confirmation(ledger.handle(), &nodes);
    let cancel = CancellationToken::new();
    let extension = spawn_extension(confirmation.clone(), &cancel);
    let factory = Arc::new(FakeFactory::new(
        confirmation,
        vec![("node-a", Script::Serve(transactions))],
    ));
    let supervisor = supervisor(factory);

    supervisor.reconcile(&nodes).await.unwrap();

    let mut faulted = false;
    for _ in 0..100 {
        let snapshot = supervisor.snapshot();
        if snapshot[0]
            .workers
            .iter()
            .any(|w| w.state == WorkerState::Faulted)
        {
            faulted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(faulted);
    assert!(matches!(
        supervisor.snapshot()[0].health,
        GroupHealth::Unhealthy(_)
    ));

    // Nothing from the broken batch reached the ledger
    assert_eq!(ledger.top_of_ledger().unwrap().state_version, 0);

    supervisor.reconcile(&nodes).await.unwrap();
    assert!(supervisor.snapshot().is_empty());
    assert!(supervisor.is_blocklisted("node-a"));

    supervisor.stop_all().await;
    cancel.cancel();
    extension.join().await;
    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quorum_follows_honest_nodes_over_forger() {
    let (ledger, _temp) = open_ledger().await;
    let honest = chain(3);
    let forged = chain_with_seed(3, 0xff);

    let nodes = vec![node("honest-a"), node("honest-b"), node("forger")];
    let confirmation = confirmation(ledger.handle(), &nodes);
    assert!(confirmation
        .handle_ledger_extension_if_quorum()
        .await
        .unwrap()
        .is_none());
    let factory = Arc::new(FakeFactory::new(
        confirmation.clone(),
        vec![
            ("honest-a", Script::Serve(honest.clone())),
            ("honest-b", Script::Serve(honest.clone())),
            ("forger", Script::Serve(forged)),
        ],
    ));
    let supervisor = supervisor(factory);

    supervisor.reconcile(&nodes).await.unwrap();

    // Let every node fill its pipeline before the quorum is counted
    for _ in 0..100 {
        let all_held = nodes.iter().all(|n| {
            confirmation
                .requested_range(&n.name)
                .is_some_and(|r| r.state_version_exclusive_lower_bound == 3)
        });
        if all_held {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let cancel = CancellationToken::new();
    let extension = spawn_extension(confirmation.clone(), &cancel);
    wait_for_state_version(&ledger, 3).await;

    let tip = ledger.top_of_ledger().unwrap();
    assert_eq!(tip.state_version, 3);
    assert_eq!(tip.accumulator, honest[2].accumulator);

    assert_eq!(confirmation.node_consistency("honest-a"), MetricStatus::Yes);
    assert_eq!(confirmation.node_consistency("honest-b"), MetricStatus::Yes);
    assert_eq!(confirmation.node_consistency("forger"), MetricStatus::No);

    // Outvoted is not faulted; the forger keeps running and stays flagged
    assert!(supervisor
        .snapshot()
        .iter()
        .all(|s| s.health == GroupHealth::Healthy));

    supervisor.stop_all().await;
    cancel.cancel();
    extension.join().await;
    ledger.shutdown().await.unwrap();
}
