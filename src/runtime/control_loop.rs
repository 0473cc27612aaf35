// src/runtime/control_loop.rs
//! Single periodic driver for autoscaling and health checks
//!
//! One thread waits on two tickers and a shutdown channel. Autoscale and
//! health ticks therefore never run concurrently, and dropping the shutdown
//! sender wakes the thread immediately instead of waiting out an interval.
//!
//! ```text
//!   tick(autoscale) ──┐
//!   tick(health)    ──┼─► select! ─► autoscale_tick / monitor.tick
//!   shutdown        ──┘          └─► exit
//! ```

use crate::model::{AlertSeverity, MetricSample, TaskStatus};
use crate::monitoring::HealthMonitor;
use crate::observability::QUEUE_DEPTH;
use crate::runtime::agent_pool::{AgentPoolManager, ScalingEvent};
use crate::storage::{Store, StoreSnapshot};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use metrics::gauge;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Midnight UTC of the current day
pub fn start_of_today() -> DateTime<Utc> {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

/// Engine-level samples recorded on every autoscale tick
fn engine_samples(
    store: &dyn Store,
    pools: &AgentPoolManager,
    snapshot: &StoreSnapshot,
) -> Result<Vec<MetricSample>> {
    let (total, active) = pools
        .pools()
        .iter()
        .fold((0, 0), |acc, p| (acc.0 + p.current_agents, acc.1 + p.active_agents));
    let today = store.task_stats(start_of_today())?;
    let pending = snapshot.tasks_with_status(TaskStatus::Pending);

    gauge!(QUEUE_DEPTH).set(pending as f64);

    Ok(vec![
        MetricSample::new("total_agents", total as f64, "count"),
        MetricSample::new("active_agents", active as f64, "count"),
        MetricSample::new("pending_tasks", pending as f64, "count"),
        MetricSample::new("completed_tasks_today", today.completed as f64, "count"),
        MetricSample::new("success_rate", today.success_rate(), "percent"),
    ])
}

/// One autoscale tick: replay deferred commits, snapshot, reconcile,
/// scale, record engine samples.
///
/// A failed snapshot skips the rest of the tick; the next one retries.
pub fn autoscale_tick(store: &dyn Store, pools: &AgentPoolManager) -> Result<Vec<ScalingEvent>> {
    if pools.deferred_commits() > 0 {
        let settled = pools.retry_deferred();
        debug!(settled, remaining = pools.deferred_commits(), "Replayed deferred commits");
    }

    let snapshot = store.snapshot()?;

    if let Err(e) = pools.reconcile() {
        warn!("Pool reconciliation failed: {}", e);
    }

    let events = pools.autoscale(&snapshot);
    for event in &events {
        debug!(domain = %event.domain, current = event.current_agents, "Autoscale applied");
    }

    match engine_samples(store, pools, &snapshot) {
        Ok(samples) => {
            if let Err(e) = store.record_metrics(&samples) {
                warn!("Failed to record engine metrics: {}", e);
            }
        }
        Err(e) => warn!("Failed to compute engine metrics: {}", e),
    }

    Ok(events)
}

pub struct ControlLoop {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlLoop {
    pub fn start(
        autoscale_every: Duration,
        health_every: Duration,
        store: Arc<dyn Store>,
        pools: Arc<AgentPoolManager>,
        monitor: Arc<HealthMonitor>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("control-loop".to_string())
            .spawn(move || {
                let autoscale = tick(autoscale_every);
                let health = tick(health_every);
                info!(
                    "Control loop started (autoscale every {:?}, health every {:?})",
                    autoscale_every, health_every
                );

                loop {
                    select! {
                        recv(autoscale) -> _ => {
                            if let Err(e) = autoscale_tick(store.as_ref(), &pools) {
                                warn!("Autoscale tick skipped: {}", e);
                            }
                        }
                        recv(health) -> _ => {
                            let report = monitor.tick();
                            for alert in report.alerts.iter().filter(|a| a.severity == AlertSeverity::Critical) {
                                error!(kind = %alert.kind, "{}", alert.message);
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }

                info!("Control loop stopped");
            })
            .map_err(|e| EngineError::InvalidState(format!("failed to spawn control loop: {}", e)))?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop the loop and wait for the current tick to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Control loop panicked");
            }
        }
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
