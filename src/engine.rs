// src/engine.rs
//! Engine context object
//!
//! Owns the store, queue, pool manager, health monitor, worker pool and
//! control loop, and exposes the operations callers use. There are no
//! process-wide singletons: build an [`Engine`] and pass it around.
//!
//! ```text
//! Engine::new ──► pools.initialize ──► recover ──► start ──► ... ──► shutdown
//!                 (reset agents,       (fail stale processing,
//!                  provision targets)   requeue pending)
//! ```

use crate::handler::DomainHandler;
use crate::model::{Agent, AgentId, AgentStatus, Pool, PoolHealth, Task, TaskId, TaskStatus};
use crate::monitoring::{HealthMonitor, HealthReport, StaticSampler, SysinfoSampler, SystemSampler};
use crate::observability::{TASKS_CANCELLED, TASKS_SUBMITTED};
use crate::runtime::agent_pool::{AgentPoolManager, ScaleDirection, ScalingEvent};
use crate::runtime::control_loop::{autoscale_tick, start_of_today, ControlLoop};
use crate::runtime::task_queue::TaskQueue;
use crate::runtime::worker_pool::{InFlight, InFlightView, WorkerContext, WorkerPool};
use crate::storage::{MemoryStore, SqliteStore, Store};
use crate::utils::config::{EngineConfig, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Times a cancel re-reads a task that changed state underneath it
const CANCEL_ATTEMPTS: usize = 3;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by engine restart";

/// Queue and worker activity
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub in_flight: Vec<InFlightView>,
    pub workers: usize,
    pub processing_active: bool,

    /// Finished tasks whose outcome awaits a store retry
    pub deferred_commits: usize,
}

/// Task throughput since midnight UTC
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub tasks_today: usize,
    pub completed_today: usize,
    pub failed_today: usize,
    pub cancelled_today: usize,
    pub success_rate: f64,
    pub avg_processing_secs: f64,
    pub queue_size: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub uptime_secs: i64,
}

/// Capacity view of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub domain: String,
    pub current_agents: usize,
    pub active_agents: usize,
    pub idle_agents: usize,
    pub min_agents: usize,
    pub max_agents: usize,

    /// Active agents as a percentage of current agents
    pub efficiency: f64,

    pub health: PoolHealth,
    pub auto_scale: bool,
}

/// What startup recovery did with tasks left by a previous run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub requeued: usize,
    pub interrupted: usize,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    pools: Arc<AgentPoolManager>,
    monitor: Arc<HealthMonitor>,
    handler: Arc<dyn DomainHandler>,
    in_flight: Arc<DashMap<TaskId, InFlight>>,
    workers: Mutex<Option<WorkerPool>>,
    control: Mutex<Option<ControlLoop>>,
    recovery: Recovery,
    started_at: DateTime<Utc>,
}

impl Engine {
    /// Build an engine with the store and sampler named by `config`
    pub fn new(config: EngineConfig, handler: Arc<dyn DomainHandler>) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn Store> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.storage.sqlite_config())?),
        };
        let sampler: Box<dyn SystemSampler> = if config.observability.sample_system {
            Box::new(SysinfoSampler::new())
        } else {
            Box::new(StaticSampler::default())
        };

        Self::with_parts(config, store, handler, sampler)
    }

    /// Build an engine around caller-supplied collaborators
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn Store>,
        handler: Arc<dyn DomainHandler>,
        sampler: Box<dyn SystemSampler>,
    ) -> Result<Self> {
        config.validate()?;

        let pools = Arc::new(AgentPoolManager::new(Arc::clone(&store), &config.pools));
        pools.initialize()?;

        let queue = Arc::new(TaskQueue::new());
        let monitor = Arc::new(HealthMonitor::new(
            config.thresholds.clone(),
            Arc::clone(&store),
            Arc::clone(&pools),
            Arc::clone(&queue),
            sampler,
        ));

        let mut engine = Self {
            config,
            store,
            queue,
            pools,
            monitor,
            handler,
            in_flight: Arc::new(DashMap::new()),
            workers: Mutex::new(None),
            control: Mutex::new(None),
            recovery: Recovery::default(),
            started_at: Utc::now(),
        };
        engine.recovery = engine.recover()?;

        info!(
            "Engine ready with {} pools ({} tasks requeued, {} interrupted)",
            engine.config.pools.len(),
            engine.recovery.requeued,
            engine.recovery.interrupted
        );
        Ok(engine)
    }

    /// Fail tasks a previous run left mid-flight and requeue pending ones
    fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        for task in self.store.list_tasks(TaskStatus::Processing)? {
            let failed = task.fail(INTERRUPTED_MESSAGE)?;
            if self.store.commit_task(&failed, TaskStatus::Processing, None)? {
                warn!(task_id = %task.id, "Task interrupted by restart marked failed");
                recovery.interrupted += 1;
            }
        }

        let mut pending = self.store.list_tasks(TaskStatus::Pending)?;
        pending.sort_by_key(|t| (t.priority, t.created_at, t.id));

        for task in pending {
            if self.pools.contains(&task.domain) {
                self.queue.push(task.id, task.domain.clone(), task.priority);
                recovery.requeued += 1;
            } else {
                warn!(task_id = %task.id, domain = %task.domain, "Pending task for unconfigured domain cancelled");
                let mut cancelled = task.cancel()?;
                cancelled.error_message = Some(format!("domain '{}' is no longer configured", task.domain));
                self.store.commit_task(&cancelled, TaskStatus::Pending, None)?;
            }
        }

        Ok(recovery)
    }

    /// Spawn the workers and the control loop
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Err(EngineError::InvalidState("engine already started".into()));
        }
        if self.queue.is_closed() {
            return Err(EngineError::InvalidState("engine has been shut down".into()));
        }

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            pools: Arc::clone(&self.pools),
            handler: Arc::clone(&self.handler),
            in_flight: Arc::clone(&self.in_flight),
            config: self.config.workers.clone(),
        });
        *workers = Some(WorkerPool::start(ctx)?);

        let control = ControlLoop::start(
            self.config.control.autoscale_interval(),
            self.config.control.health_interval(),
            Arc::clone(&self.store),
            Arc::clone(&self.pools),
            Arc::clone(&self.monitor),
        )?;
        *self.control.lock() = Some(control);
        self.monitor.set_active(true);

        info!("Engine started with {} workers", self.config.workers.count);
        Ok(())
    }

    /// Stop the control loop, then drain the workers.
    ///
    /// Workers finish the task they hold; queued tasks stay `pending` and
    /// are requeued by the next engine over the same store.
    pub fn shutdown(&self) {
        if let Some(control) = self.control.lock().take() {
            control.shutdown();
        }
        if let Some(workers) = self.workers.lock().take() {
            workers.shutdown();
            info!("Engine stopped");
        }
        self.monitor.set_active(false);
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    /// Admit a task; returns its id
    pub fn submit_task(&self, domain: &str, payload: &str, priority: u8) -> Result<TaskId> {
        if !self.pools.contains(domain) {
            return Err(EngineError::validation(format!("unknown domain '{}'", domain)));
        }

        let task = Task::new(domain, payload, priority)?;
        self.store.insert_task(&task)?;
        self.queue.push(task.id, domain, priority);

        counter!(TASKS_SUBMITTED, "domain" => domain.to_string()).increment(1);
        debug!(task_id = %task.id, domain, priority, "Task submitted");
        Ok(task.id)
    }

    pub fn get_task_status(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))
    }

    /// Cancel a pending or processing task.
    ///
    /// A processing task keeps running inside its handler; the worker's
    /// later result is discarded.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<Task> {
        for _ in 0..CANCEL_ATTEMPTS {
            let task = self.get_task_status(task_id)?;
            let expected = task.status;
            if task.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "task {} is already {}",
                    task_id, task.status
                )));
            }

            // The queue entry goes only once the store agrees; a failed
            // commit leaves the task pending and still queued.
            let cancelled = task.cancel()?;
            if self.pools.commit_transition(&cancelled, expected, None)? {
                if expected == TaskStatus::Pending {
                    self.queue.remove(task_id);
                }
                counter!(TASKS_CANCELLED, "domain" => cancelled.domain.clone()).increment(1);
                info!(task_id = %task_id, "Task cancelled while {}", expected);
                return Ok(cancelled);
            }
            debug!(task_id = %task_id, "Task changed state during cancel, re-reading");
        }

        Err(EngineError::InvalidState(format!(
            "task {} kept changing state during cancellation",
            task_id
        )))
    }

    /// Manually grow or shrink a pool; returns the new agent count
    pub fn scale_pool(&self, domain: &str, direction: ScaleDirection, count: usize) -> Result<usize> {
        self.pools.scale_pool(domain, direction, count)
    }

    /// Operator override of an agent's status
    pub fn set_agent_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<Agent> {
        self.pools.set_agent_status(agent_id, status)
    }

    /// Run one autoscale tick now, outside the control loop cadence
    pub fn autoscale_tick(&self) -> Result<Vec<ScalingEvent>> {
        autoscale_tick(self.store.as_ref(), &self.pools)
    }

    pub fn get_health_report(&self) -> HealthReport {
        self.monitor.get_health_report()
    }

    pub fn run_health_check(&self) -> HealthReport {
        self.monitor.run_health_check()
    }

    pub fn quick_status(&self) -> String {
        self.monitor.quick_status()
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.pools.pools()
    }

    pub fn pool(&self, domain: &str) -> Result<Pool> {
        self.pools
            .pool(domain)
            .ok_or_else(|| EngineError::NotFound(format!("pool {}", domain)))
    }

    pub fn agents(&self, domain: &str) -> Result<Vec<Agent>> {
        if !self.pools.contains(domain) {
            return Err(EngineError::NotFound(format!("pool {}", domain)));
        }
        self.store.list_agents(domain)
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().as_ref().map(WorkerPool::size).unwrap_or(0)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let mut in_flight: Vec<InFlightView> =
            self.in_flight.iter().map(|entry| InFlightView::from(entry.value())).collect();
        in_flight.sort_by_key(|view| view.worker_id);

        QueueStatus {
            queue_size: self.queue.len(),
            in_flight,
            workers: self.worker_count(),
            processing_active: self.is_running(),
            deferred_commits: self.pools.deferred_commits(),
        }
    }

    pub fn performance_metrics(&self) -> Result<PerformanceMetrics> {
        let stats = self.store.task_stats(start_of_today())?;

        Ok(PerformanceMetrics {
            tasks_today: stats.total,
            completed_today: stats.completed,
            failed_today: stats.failed,
            cancelled_today: stats.cancelled,
            success_rate: stats.success_rate(),
            avg_processing_secs: stats.avg_processing_secs,
            queue_size: self.queue.len(),
            in_flight: self.in_flight.len(),
            workers: self.worker_count(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        })
    }

    pub fn system_status(&self) -> Vec<PoolStatus> {
        self.pools
            .pools()
            .into_iter()
            .map(|pool| PoolStatus {
                idle_agents: pool.idle_capacity(),
                efficiency: pool.utilization(),
                domain: pool.domain,
                current_agents: pool.current_agents,
                active_agents: pool.active_agents,
                min_agents: pool.min_agents,
                max_agents: pool.max_agents,
                health: pool.health_status,
                auto_scale: pool.auto_scale,
            })
            .collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EchoHandler, HandlerError};
    use crate::storage::faulty::FaultyStore;
    use crate::utils::config::{PoolConfig, PoolsConfig};
    use std::collections::BTreeMap;

    fn config() -> EngineConfig {
        let mut pools = BTreeMap::new();
        pools.insert("general".to_string(), PoolConfig::new(1, 5, 1));
        pools.insert("sports".to_string(), PoolConfig::new(1, 3, 2));

        let mut config = EngineConfig::default();
        config.pools = PoolsConfig(pools);
        config.observability.sample_system = false;
        config
    }

    fn engine() -> Engine {
        Engine::new(config(), Arc::new(EchoHandler)).unwrap()
    }

    #[test]
    fn test_submit_validation() {
        let engine = engine();
        assert!(matches!(engine.submit_task("general", "q", 0), Err(EngineError::Validation(_))));
        assert!(matches!(engine.submit_task("general", "q", 11), Err(EngineError::Validation(_))));
        assert!(matches!(engine.submit_task("weather", "q", 5), Err(EngineError::Validation(_))));

        let id = engine.submit_task("general", "q", 5).unwrap();
        assert_eq!(engine.get_task_status(id).unwrap().status, TaskStatus::Pending);
        assert_eq!(engine.queue_status().queue_size, 1);
    }

    #[test]
    fn test_unknown_task() {
        let engine = engine();
        assert!(matches!(
            engine.get_task_status(ulid::Ulid::new()),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.cancel_task(ulid::Ulid::new()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_cancel_terminal_task_rejected() {
        let engine = engine();
        let id = engine.submit_task("general", "q", 5).unwrap();
        engine.cancel_task(id).unwrap();
        assert!(matches!(engine.cancel_task(id), Err(EngineError::InvalidState(_))));
    }

    fn faulty_engine(handler: Arc<dyn DomainHandler>) -> (Arc<FaultyStore>, Engine) {
        let store = Arc::new(FaultyStore::new());
        let mut config = config();
        config.workers.count = 1;
        config.workers.poll_timeout_ms = 20;
        config.workers.requeue_backoff_ms = 5;
        let engine = Engine::with_parts(
            config,
            store.clone(),
            handler,
            Box::new(StaticSampler::default()),
        )
        .unwrap();
        (store, engine)
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !done() {
            assert!(std::time::Instant::now() < deadline, "timed out");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn test_failed_cancel_keeps_task_queued() {
        let (store, engine) = faulty_engine(Arc::new(EchoHandler));
        let id = engine.submit_task("general", "q", 5).unwrap();

        store.fail_commits(true);
        assert!(matches!(engine.cancel_task(id), Err(EngineError::Persistence(_))));
        assert_eq!(engine.get_task_status(id).unwrap().status, TaskStatus::Pending);
        assert_eq!(engine.queue_status().queue_size, 1);

        store.fail_commits(false);
        engine.start().unwrap();
        wait_for(|| engine.get_task_status(id).unwrap().status == TaskStatus::Completed);
    }

    #[test]
    fn test_outage_during_commit_recovers_on_tick() {
        let outage: Arc<Mutex<Option<Arc<FaultyStore>>>> = Arc::new(Mutex::new(None));
        let trigger = Arc::clone(&outage);
        let handler = move |domain: &str, payload: &str| -> std::result::Result<String, HandlerError> {
            if payload == "first" {
                if let Some(store) = trigger.lock().as_ref() {
                    store.fail_commits(true);
                }
            }
            Ok(format!("[{}] {}", domain, payload))
        };
        let (store, engine) = faulty_engine(Arc::new(handler));
        *outage.lock() = Some(store.clone());

        let first = engine.submit_task("sports", "first", 5).unwrap();
        engine.start().unwrap();
        wait_for(|| engine.queue_status().deferred_commits == 1);
        assert_eq!(engine.get_task_status(first).unwrap().status, TaskStatus::Processing);

        store.fail_commits(false);
        engine.autoscale_tick().unwrap();
        assert_eq!(engine.queue_status().deferred_commits, 0);
        assert_eq!(engine.get_task_status(first).unwrap().status, TaskStatus::Completed);
        assert_eq!(engine.pool("sports").unwrap().active_agents, 0);

        let second = engine.submit_task("sports", "second", 5).unwrap();
        wait_for(|| engine.get_task_status(second).unwrap().status == TaskStatus::Completed);
    }

    #[test]
    fn test_system_status() {
        let engine = engine();
        let status = engine.system_status();
        assert_eq!(status.len(), 2);
        let sports = status.iter().find(|p| p.domain == "sports").unwrap();
        assert_eq!(sports.current_agents, 2);
        assert_eq!(sports.idle_agents, 2);
        assert_eq!(sports.efficiency, 0.0);
    }

    #[test]
    fn test_start_twice_rejected() {
        let engine = engine();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::InvalidState(_))));
        assert_eq!(engine.queue_status().workers, 5);
        assert!(engine.get_health_report().monitoring_active);

        engine.shutdown();
        assert!(!engine.is_running());
        assert!(!engine.get_health_report().monitoring_active);
        assert!(matches!(engine.start(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_recovery_after_restart() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = Engine::with_parts(
            config(),
            Arc::clone(&store),
            Arc::new(EchoHandler),
            Box::new(StaticSampler::default()),
        )
        .unwrap();

        let low = first.submit_task("general", "later", 9).unwrap();
        let urgent = first.submit_task("general", "now", 1).unwrap();
        let stuck = first.submit_task("general", "stuck", 5).unwrap();

        // Simulate a crash while `stuck` was running
        let task = store.get_task(stuck).unwrap().unwrap();
        let agent = store.list_idle_agents("general").unwrap().remove(0);
        store
            .commit_task(&task.start(agent.id).unwrap(), TaskStatus::Pending, Some(&agent.occupy(stuck)))
            .unwrap();
        drop(first);

        let second = Engine::with_parts(
            config(),
            Arc::clone(&store),
            Arc::new(EchoHandler),
            Box::new(StaticSampler::default()),
        )
        .unwrap();

        assert_eq!(second.recovery(), &Recovery { requeued: 2, interrupted: 1 });
        let failed = second.get_task_status(stuck).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(second.pool("general").unwrap().active_agents, 0);

        assert_eq!(second.queue.try_pop().unwrap().task_id, urgent);
        assert_eq!(second.queue.try_pop().unwrap().task_id, low);
    }

    #[test]
    fn test_performance_metrics() {
        let engine = engine();
        engine.submit_task("general", "q", 5).unwrap();
        let metrics = engine.performance_metrics().unwrap();
        assert_eq!(metrics.tasks_today, 1);
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(metrics.workers, 0);
    }
}
