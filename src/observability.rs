// src/observability.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` registry with an `EnvFilter` and a
//!   pretty or JSON fmt layer
//! - **Metrics**: Prometheus exporter behind the `metrics` facade
//!
//! Metric names are collected here so the worker pool, pool manager and
//! health monitor report under one naming scheme.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const TASKS_SUBMITTED: &str = "taskflow_tasks_submitted_total";
pub const TASKS_COMPLETED: &str = "taskflow_tasks_completed_total";
pub const TASKS_FAILED: &str = "taskflow_tasks_failed_total";
pub const TASKS_CANCELLED: &str = "taskflow_tasks_cancelled_total";
pub const TASKS_REQUEUED: &str = "taskflow_tasks_requeued_total";
pub const TASKS_DISCARDED: &str = "taskflow_tasks_discarded_total";
pub const TASK_DURATION: &str = "taskflow_task_duration_seconds";
pub const QUEUE_DEPTH: &str = "taskflow_queue_depth";
pub const POOL_CURRENT_AGENTS: &str = "taskflow_pool_current_agents";
pub const POOL_ACTIVE_AGENTS: &str = "taskflow_pool_active_agents";
pub const POOL_SCALE_EVENTS: &str = "taskflow_pool_scale_events_total";
pub const HEALTH_SCORE: &str = "taskflow_health_score";
pub const ACTIVE_ALERTS: &str = "taskflow_active_alerts";
pub const STORE_ERRORS: &str = "taskflow_store_errors_total";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_names(true),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_names(true),
            )
            .try_init()?,
    }

    info!(format = ?config.log_format, level = %config.log_level, "Tracing initialized");
    Ok(())
}

/// Install the Prometheus recorder with a scrape listener on `addr`.
///
/// Without an address no recorder is installed and metric calls are no-ops.
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        info!("Metrics exporter disabled");
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
