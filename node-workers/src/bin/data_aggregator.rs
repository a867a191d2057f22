//! Data Aggregator Binary
//!
//! Ingests committed transactions from the configured full nodes into the
//! local ledger.

use anyhow::Context;
use gateway_ledger_core::Ledger;
use gateway_node_workers::{
    AggregatorConfig, DefaultFatalClassifier, HttpNodeContextFactory, LedgerConfirmationService,
    LedgerExtensionWorker, LoopedWorker, NodeWorkerSupervisor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting data aggregator");

    // Load configuration
    let config = match std::env::args().nth(1).or_else(|| std::env::var("AGGREGATOR_CONFIG").ok()) {
        Some(path) => {
            info!("Loading config from: {}", path);
            AggregatorConfig::from_file(&path).with_context(|| format!("loading {}", path))?
        }
        None => {
            info!("No config file given, using defaults");
            let mut config = AggregatorConfig::default();
            config.ledger = gateway_ledger_core::Config::from_env()?;
            config.validate()?;
            config
        }
    };

    let nodes = config.enabled_nodes();
    info!(
        network = %config.network_name,
        nodes = nodes.len(),
        data_dir = ?config.ledger.data_dir,
        "Configuration loaded"
    );

    // Open ledger
    let ledger = Ledger::open(config.ledger.clone())
        .await
        .context("opening ledger")?;
    let tip = ledger.top_of_ledger()?;
    info!(state_version = tip.state_version, epoch = tip.epoch, "Ledger ready");

    let confirmation = Arc::new(LedgerConfirmationService::new(
        ledger.handle(),
        &nodes,
        config.confirmation.clone(),
    )?);
    let factory = HttpNodeContextFactory::new(
        confirmation.clone(),
        config.network_name.clone(),
        config.fetch.clone(),
    );
    let classifier = Arc::new(DefaultFatalClassifier);
    let supervisor = Arc::new(NodeWorkerSupervisor::new(
        Arc::new(factory),
        classifier.clone(),
        config.startup_blocklist(),
    ));

    let cancel = CancellationToken::new();
    let extension = Arc::new(LoopedWorker::spawn(
        Arc::new(LedgerExtensionWorker::new(
            confirmation,
            config.confirmation.delay_between_loops()?,
        )),
        classifier,
        cancel.clone(),
    ));
    let mut extension_task = {
        let extension = extension.clone();
        tokio::spawn(async move {
            extension.join().await;
            extension.status()
        })
    };
    let mut extension_exited = false;
    let supervisor_task = {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(config.reconcile_interval_ms);
        tokio::spawn(async move { supervisor.run(nodes, interval, cancel).await })
    };

    info!("Data aggregator running");

    // Wait for shutdown signal, a fatal supervisor exit or the extension loop dying
    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received shutdown signal"),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            cancel.cancel();
            Ok(())
        }
        joined = supervisor_task => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Supervisor failed");
                    Err(anyhow::Error::new(e))
                }
                Err(e) => Err(anyhow::anyhow!("supervisor task failed: {}", e)),
            }
        }
        joined = &mut extension_task => {
            extension_exited = true;
            match joined {
                Ok(status) => {
                    error!(state = ?status.state, error = ?status.last_error, "Ledger extension worker exited");
                    Err(anyhow::anyhow!(
                        "ledger extension worker exited: {}",
                        status.last_error.unwrap_or_default()
                    ))
                }
                Err(e) => Err(anyhow::anyhow!("ledger extension task failed: {}", e)),
            }
        }
    };

    // Graceful shutdown
    info!("Shutting down data aggregator...");
    cancel.cancel();
    supervisor.stop_all().await;
    if !extension_exited {
        if let Err(e) = extension_task.await {
            error!("Ledger extension task failed: {}", e);
        }
    }
    ledger.shutdown().await?;

    info!("Data aggregator stopped");
    outcome
}
