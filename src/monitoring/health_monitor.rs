// src/monitoring/health_monitor.rs
//! Composite health scoring and alerting
//!
//! Every health tick gathers four inputs, then derives alerts and a score:
//!
//! ```text
//! host sampler ───┐
//! pool counts  ───┤                 ┌─► alerts ─┐
//! store ping   ───┼─► HealthData ───┤           ├─► score (0-100) ─► status
//! queue depth  ───┘                 └───────────┘
//! ```
//!
//! Alerts and the score are pure functions of [`HealthData`], so a report
//! can always be recomputed from the latest collection.

use crate::model::{Alert, AlertKind, AlertSeverity, AgentStatus, MetricSample, PoolHealth, TaskStatus};
use crate::monitoring::sampler::{SystemSample, SystemSampler};
use crate::monitoring::thresholds::AlertThresholds;
use crate::observability::{ACTIVE_ALERTS, HEALTH_SCORE};
use crate::runtime::agent_pool::AgentPoolManager;
use crate::runtime::task_queue::TaskQueue;
use crate::storage::{Store, StoreSnapshot};
use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Overall health bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Critical,
    Degraded,
    Warning,
    Healthy,
    Excellent,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            HealthStatus::Excellent
        } else if score >= 75.0 {
            HealthStatus::Healthy
        } else if score >= 60.0 {
            HealthStatus::Warning
        } else if score >= 40.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Excellent => "Excellent",
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Warning => "Warning",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Critical => "Critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Healthy,
    Slow,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseHealth {
    pub status: DatabaseStatus,
    pub latency_ms: f64,
    pub pending_tasks: usize,
    pub processing_tasks: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealthReport {
    pub domain: String,
    pub total_agents: usize,
    pub active_agents: usize,
    pub failed_agents: usize,
    pub min_agents: usize,
    pub max_agents: usize,

    /// Failed agents as a percentage of all agents
    pub failure_rate: f64,

    /// Active agents as a percentage of all agents
    pub utilization: f64,

    pub status: PoolHealth,
}

/// Raw inputs gathered on one health tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthData {
    pub system: SystemSample,
    pub pools: Vec<PoolHealthReport>,
    pub database: DatabaseHealth,
    pub queue_depth: usize,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub score: f64,
    pub status: HealthStatus,
    pub system: SystemSample,
    pub pools: Vec<PoolHealthReport>,
    pub database: DatabaseHealth,
    pub queue_depth: usize,
    pub alerts: Vec<Alert>,
    pub monitoring_active: bool,
    pub collected_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

/// Classify a pool from its agent counts
pub fn pool_status(
    total: usize,
    active: usize,
    failed: usize,
    min_agents: usize,
    thresholds: &AlertThresholds,
) -> (PoolHealth, f64, f64) {
    let (failure_rate, utilization) = if total > 0 {
        (
            failed as f64 / total as f64 * 100.0,
            active as f64 / total as f64 * 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    let status = if failure_rate > thresholds.agent_failure_rate {
        PoolHealth::Critical
    } else if total < min_agents {
        PoolHealth::Warning
    } else if utilization > thresholds.overloaded_utilization {
        PoolHealth::Overloaded
    } else {
        PoolHealth::Healthy
    };

    (status, failure_rate, utilization)
}

/// Threshold alerts for one collection
pub fn evaluate_alerts(data: &HealthData, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let system = &data.system;

    if system.cpu_usage > thresholds.cpu_usage {
        alerts.push(Alert::new(
            AlertKind::System,
            AlertSeverity::Warning,
            format!("High CPU usage: {:.1}%", system.cpu_usage),
        ));
    }
    if system.memory_usage > thresholds.memory_usage {
        alerts.push(Alert::new(
            AlertKind::System,
            AlertSeverity::Critical,
            format!("High memory usage: {:.1}%", system.memory_usage),
        ));
    }
    if system.disk_usage > thresholds.disk_usage {
        alerts.push(Alert::new(
            AlertKind::System,
            AlertSeverity::Critical,
            format!("High disk usage: {:.1}%", system.disk_usage),
        ));
    }

    for pool in &data.pools {
        match pool.status {
            PoolHealth::Critical => alerts.push(Alert::new(
                AlertKind::Agent,
                AlertSeverity::Critical,
                format!("{} pool critical: {:.1}% failure rate", pool.domain, pool.failure_rate),
            )),
            PoolHealth::Warning => alerts.push(Alert::new(
                AlertKind::Agent,
                AlertSeverity::Warning,
                format!("{} pool below minimum agents", pool.domain),
            )),
            _ => {}
        }
    }

    match data.database.status {
        DatabaseStatus::Unreachable => alerts.push(Alert::new(
            AlertKind::Database,
            AlertSeverity::Critical,
            format!(
                "Database error: {}",
                data.database.error.as_deref().unwrap_or("unknown error")
            ),
        )),
        DatabaseStatus::Slow => alerts.push(Alert::new(
            AlertKind::Database,
            AlertSeverity::Warning,
            format!("Slow database response: {:.2}ms", data.database.latency_ms),
        )),
        DatabaseStatus::Healthy => {}
    }

    if data.database.pending_tasks > thresholds.queue_size_warning {
        alerts.push(Alert::new(
            AlertKind::Queue,
            AlertSeverity::Warning,
            format!("Task backlog: {} pending tasks", data.database.pending_tasks),
        ));
    }

    alerts
}

/// Composite score in `[0, 100]`
pub fn health_score(data: &HealthData, alerts: &[Alert]) -> f64 {
    let mut score = 100.0;
    let system = &data.system;

    score -= (system.cpu_usage - 70.0).max(0.0) * 0.5;
    score -= (system.memory_usage - 80.0).max(0.0) * 0.7;
    score -= (system.disk_usage - 85.0).max(0.0) * 0.3;

    let mut critical_pools = 0;
    for pool in &data.pools {
        score -= match pool.status {
            PoolHealth::Critical => {
                critical_pools += 1;
                15.0
            }
            PoolHealth::Warning => 5.0,
            PoolHealth::Overloaded => 3.0,
            PoolHealth::Healthy => 0.0,
        };
    }
    if !data.pools.is_empty() && critical_pools * 2 > data.pools.len() {
        score -= 20.0;
    }

    score -= match data.database.status {
        DatabaseStatus::Unreachable => 25.0,
        DatabaseStatus::Slow => 10.0,
        DatabaseStatus::Healthy => 0.0,
    };

    for alert in alerts {
        score -= match alert.severity {
            AlertSeverity::Critical => 5.0,
            AlertSeverity::Warning => 2.0,
        };
    }

    score.clamp(0.0, 100.0)
}

struct Evaluation {
    data: HealthData,
    alerts: Vec<Alert>,
}

pub struct HealthMonitor {
    thresholds: AlertThresholds,
    store: Arc<dyn Store>,
    pools: Arc<AgentPoolManager>,
    queue: Arc<TaskQueue>,
    sampler: Mutex<Box<dyn SystemSampler>>,
    latest: RwLock<Option<Evaluation>>,

    /// Last snapshot the store produced; used when it stops answering
    last_snapshot: Mutex<Option<StoreSnapshot>>,

    monitoring_active: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        thresholds: AlertThresholds,
        store: Arc<dyn Store>,
        pools: Arc<AgentPoolManager>,
        queue: Arc<TaskQueue>,
        sampler: Box<dyn SystemSampler>,
    ) -> Self {
        Self {
            thresholds,
            store,
            pools,
            queue,
            sampler: Mutex::new(sampler),
            latest: RwLock::new(None),
            last_snapshot: Mutex::new(None),
            monitoring_active: AtomicBool::new(false),
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn set_active(&self, active: bool) {
        self.monitoring_active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.monitoring_active.load(Ordering::Acquire)
    }

    /// Gather one round of inputs
    pub fn collect(&self) -> HealthData {
        let system = self.sampler.lock().sample();

        let started = Instant::now();
        let ping = self.store.ping();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let snapshot = match self.store.snapshot() {
            Ok(snapshot) => {
                *self.last_snapshot.lock() = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                warn!("Store snapshot failed, using last known counts: {}", e);
                Err(e)
            }
        };

        let (status, error) = match (&ping, &snapshot) {
            (Err(e), _) | (Ok(()), Err(e)) => (DatabaseStatus::Unreachable, Some(e.to_string())),
            _ if latency_ms > self.thresholds.slow_response_secs * 1000.0 => {
                (DatabaseStatus::Slow, None)
            }
            _ => (DatabaseStatus::Healthy, None),
        };

        let counts = match snapshot {
            Ok(snapshot) => snapshot,
            Err(_) => self.last_snapshot.lock().clone().unwrap_or_default(),
        };

        let pools = self
            .pools
            .pools()
            .into_iter()
            .map(|pool| {
                let total = counts.total_agents(&pool.domain);
                let active = counts.agents(&pool.domain, AgentStatus::Active);
                let failed = counts.agents(&pool.domain, AgentStatus::Failed);
                let (status, failure_rate, utilization) =
                    pool_status(total, active, failed, pool.min_agents, &self.thresholds);

                PoolHealthReport {
                    domain: pool.domain,
                    total_agents: total,
                    active_agents: active,
                    failed_agents: failed,
                    min_agents: pool.min_agents,
                    max_agents: pool.max_agents,
                    failure_rate,
                    utilization,
                    status,
                }
            })
            .collect();

        HealthData {
            system,
            pools,
            database: DatabaseHealth {
                status,
                latency_ms,
                pending_tasks: counts.tasks_with_status(TaskStatus::Pending),
                processing_tasks: counts.tasks_with_status(TaskStatus::Processing),
                error,
            },
            queue_depth: self.queue.len(),
            collected_at: Utc::now(),
        }
    }

    /// One health tick: collect, alert, record samples and pool health.
    ///
    /// Store writes are best effort; failures are logged and the report is
    /// still produced.
    pub fn tick(&self) -> HealthReport {
        let data = self.collect();
        let alerts = evaluate_alerts(&data, &self.thresholds);

        let system = &data.system;
        let samples = [
            MetricSample::new("cpu_usage_percent", system.cpu_usage, "percent"),
            MetricSample::new("memory_usage_percent", system.memory_usage, "percent"),
            MetricSample::new("disk_usage_percent", system.disk_usage, "percent"),
            MetricSample::new("memory_available_mb", system.memory_available_mb, "MB"),
        ];
        if let Err(e) = self.store.record_metrics(&samples) {
            warn!("Failed to record system metrics: {}", e);
        }
        if !alerts.is_empty() {
            warn!("Health alerts generated: {} alerts", alerts.len());
            if let Err(e) = self.store.record_alerts(&alerts) {
                warn!("Failed to record alerts: {}", e);
            }
        }

        for pool in &data.pools {
            if let Err(e) = self.pools.set_health(&pool.domain, pool.status) {
                warn!("Failed to update {} pool health: {}", pool.domain, e);
            }
        }

        *self.latest.write() = Some(Evaluation { data, alerts });

        let report = self.build_report();
        info!(score = report.score, status = %report.status, "Health check complete");
        report
    }

    fn build_report(&self) -> HealthReport {
        let cached = self
            .latest
            .read()
            .as_ref()
            .map(|evaluation| (evaluation.data.clone(), evaluation.alerts.clone()));
        let (data, alerts) = match cached {
            Some(cached) => cached,
            None => {
                let data = self.collect();
                let alerts = evaluate_alerts(&data, &self.thresholds);
                (data, alerts)
            }
        };

        let score = health_score(&data, &alerts);
        gauge!(HEALTH_SCORE).set(score);
        gauge!(ACTIVE_ALERTS).set(alerts.len() as f64);

        HealthReport {
            score,
            status: HealthStatus::from_score(score),
            system: data.system,
            pools: data.pools,
            database: data.database,
            queue_depth: data.queue_depth,
            alerts,
            monitoring_active: self.is_active(),
            collected_at: data.collected_at,
            generated_at: Utc::now(),
        }
    }

    /// Report from the latest collection.
    ///
    /// While the control loop is not ticking, every call collects afresh;
    /// otherwise the last tick's data is reused.
    pub fn get_health_report(&self) -> HealthReport {
        if !self.is_active() || self.latest.read().is_none() {
            debug!("Collecting health data for report");
            let data = self.collect();
            let alerts = evaluate_alerts(&data, &self.thresholds);
            *self.latest.write() = Some(Evaluation { data, alerts });
        }
        self.build_report()
    }

    /// Force a fresh collection outside the tick cadence
    pub fn run_health_check(&self) -> HealthReport {
        self.tick()
    }

    /// One-line summary, e.g. `System Health: Healthy (82/100) • 2 alerts`
    pub fn quick_status(&self) -> String {
        let report = self.get_health_report();
        let count = report.alerts.len();
        let alerts = match count {
            0 => String::new(),
            1 => " • 1 alert".to_string(),
            n => format!(" • {} alerts", n),
        };
        format!("System Health: {} ({:.0}/100){}", report.status, report.score, alerts)
    }
}
