// src/main.rs
//! Agent Pool Engine
//!
//! Starts a pool manager for the configured agent types, serving them with
//! simulated handlers, and runs until interrupted.

use agent_pool_engine::observability::{init_metrics, init_tracing_with};
use agent_pool_engine::{EngineConfig, HandlerRegistry, PoolManager, SimulatedHandler};
use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics, logging)
    init_tracing_with(&config.logging)?;
    let _metrics = init_metrics()?;

    info!(
        "Starting Agent Pool Engine v{} ({})",
        agent_pool_engine::VERSION,
        agent_pool_engine::GIT_HASH
    );
    info!("Configuration loaded: {:?}", config);

    let mut registry = HandlerRegistry::new();
    for pool in &config.pools {
        registry.register(pool.agent_type.clone(), SimulatedHandler::default);
    }

    let status_interval = config.runtime.metrics_interval().max(Duration::from_secs(1));
    let manager = PoolManager::initialize(config, registry)?;

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            _ = ticker.tick() => {
                let status = manager.get_status();
                for pool in &status.pools {
                    info!(
                        "Pool '{}': {} agents, {} active, {} queued, {:.0}% utilization",
                        pool.agent_type, pool.agents, pool.active_jobs, pool.queue_length, pool.utilization
                    );
                }
            }
        }
    }

    let report = manager.shutdown().await?;
    info!(
        "Stopped gracefully: {} jobs cancelled, {} workers terminated",
        report.cancelled_jobs + report.interrupted_jobs,
        report.terminated_workers
    );
    Ok(())
}
