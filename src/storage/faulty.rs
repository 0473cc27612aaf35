// src/storage/faulty.rs
//! Store wrapper with switchable failures, for exercising error paths

use super::{MemoryStore, Store, StoreSnapshot, TaskStats};
use crate::model::{Agent, AgentId, Alert, MetricSample, Pool, Task, TaskId, TaskStatus};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    failing_commits: AtomicBool,
    unreachable: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `commit_task` fail until switched back
    pub fn fail_commits(&self, failing: bool) {
        self.failing_commits.store(failing, Ordering::SeqCst);
    }

    /// Make `ping`, `snapshot` and metric/alert writes fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(EngineError::persistence("database is locked"))
        } else {
            Ok(())
        }
    }
}

impl Store for FaultyStore {
    fn ping(&self) -> Result<()> {
        self.check(&self.unreachable)?;
        self.inner.ping()
    }

    fn insert_task(&self, task: &Task) -> Result<()> {
        self.inner.insert_task(task)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.inner.get_task(id)
    }

    fn list_tasks(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.inner.list_tasks(status)
    }

    fn commit_task(&self, task: &Task, expected: TaskStatus, agent: Option<&Agent>) -> Result<bool> {
        self.check(&self.failing_commits)?;
        self.inner.commit_task(task, expected, agent)
    }

    fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        self.inner.task_stats(since)
    }

    fn insert_agent(&self, agent: &Agent) -> Result<()> {
        self.inner.insert_agent(agent)
    }

    fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        self.inner.get_agent(id)
    }

    fn update_agent(&self, agent: &Agent) -> Result<()> {
        self.inner.update_agent(agent)
    }

    fn delete_agent(&self, id: AgentId) -> Result<bool> {
        self.inner.delete_agent(id)
    }

    fn list_agents(&self, domain: &str) -> Result<Vec<Agent>> {
        self.inner.list_agents(domain)
    }

    fn list_idle_agents(&self, domain: &str) -> Result<Vec<Agent>> {
        self.inner.list_idle_agents(domain)
    }

    fn save_pool(&self, pool: &Pool) -> Result<()> {
        self.inner.save_pool(pool)
    }

    fn load_pools(&self) -> Result<Vec<Pool>> {
        self.inner.load_pools()
    }

    fn record_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        self.check(&self.unreachable)?;
        self.inner.record_metrics(samples)
    }

    fn record_alerts(&self, alerts: &[Alert]) -> Result<()> {
        self.check(&self.unreachable)?;
        self.inner.record_alerts(alerts)
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.inner.recent_alerts(limit)
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        self.check(&self.unreachable)?;
        self.inner.snapshot()
    }
}
