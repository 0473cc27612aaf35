// src/main.rs
//! Taskflow Engine
//!
//! Runs the task engine with the echo handler until interrupted, then
//! drains the workers and prints a final health report.

use anyhow::{Context, Result};
use std::sync::Arc;
use taskflow_engine::observability::{init_metrics, init_tracing};
use taskflow_engine::{EchoHandler, Engine, EngineConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it carries the log level and metrics address
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics, logging)
    init_tracing(&config.observability)?;
    init_metrics(config.observability.metrics_addr)?;

    info!("Starting Taskflow Engine v{}", taskflow_engine::VERSION);
    info!("Configuration loaded: {:?}", config);

    let engine = Arc::new(Engine::new(config, Arc::new(EchoHandler))?);
    engine.start()?;
    info!("{}", engine.quick_status());

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    // Joining worker threads blocks
    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;

    let report = engine.run_health_check();
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!("Engine stopped gracefully");
    Ok(())
}
