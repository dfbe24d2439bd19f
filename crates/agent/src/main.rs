//! Green guardian agent
//!
//! This binary runs as a DaemonSet on each Kubernetes node, estimating the
//! energy use of local workloads and acting on efficiency recommendations.

use anyhow::{Context, Result};
use green_guardian_agent::{api, shutdown::ShutdownSignal};
use guardian_lib::{
    actions::{ActionLog, KubeClusterApi},
    collector::KubeMetricsSource,
    health::HealthRegistry,
    observability::{AgentMetrics, StructuredLogger},
    oracle::HttpOracle,
    ControlLoopBuilder, GuardianConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting green-guardian-agent");

    // Invalid constants are fatal
    let config = GuardianConfig::load().context("Refusing to start with invalid configuration")?;
    info!(node_name = %config.node_name, region = %config.region, "Agent configured");

    let health_registry = HealthRegistry::with_components().await;
    let metrics = AgentMetrics::new().context("Failed to register metrics")?;
    let logger = StructuredLogger::new(config.node_name.clone());

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let source = Arc::new(KubeMetricsSource::new(
        client.clone(),
        config.node_name.clone(),
        config.sampler.scope,
    ));
    let cluster = Arc::new(KubeClusterApi::new(client));
    let oracle = Arc::new(HttpOracle::new(&config.oracle).context("Failed to create oracle client")?);

    let action_log = match &config.ledger.audit_log_path {
        Some(path) => ActionLog::open(config.ledger.audit_log_capacity, path)
            .await
            .with_context(|| format!("Failed to open audit log {}", path.display()))?,
        None => {
            warn!("No audit_log_path configured; action records are kept in memory only");
            ActionLog::in_memory(config.ledger.audit_log_capacity)
        }
    };

    let control = ControlLoopBuilder::new(config.clone())
        .source(source)
        .oracle(oracle)
        .cluster(cluster)
        .action_log(Arc::new(action_log))
        .metrics(metrics.clone())
        .health(health_registry.clone())
        .build()?;

    let app_state = Arc::new(api::AppState::new(
        health_registry,
        metrics,
        control.controller().clone(),
        control.ledger().clone(),
    ));

    logger.log_startup(AGENT_VERSION, config.sampler.scope.as_str());

    let mut signals = ShutdownSignal::install().context("Failed to install signal handlers")?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let loop_handle = tokio::spawn(control.run(shutdown_tx.subscribe()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    let received = signals.recv().await;
    logger.log_shutdown(&format!("{} received", received));
    let _ = shutdown_tx.send(());

    loop_handle.await.context("Control loop task failed")?;
    api_handle.await.context("API task failed")??;
    info!("Shutdown complete");

    Ok(())
}
