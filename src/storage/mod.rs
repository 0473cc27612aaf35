// src/storage/mod.rs
//! Persistence for tasks, agents, pools, metric samples and alerts
//!
//! - **Store**: the collaborator trait every backend implements
//! - **MemoryStore**: in-process maps behind one lock
//! - **SqliteStore**: rusqlite-backed relational store
//!
//! # Consistency
//!
//! ```text
//! worker / cancel ──► commit_task(task, expected, agent?) ──► one transaction
//! control loop    ──► snapshot()                         ──► one consistent read
//! ```
//!
//! `commit_task` is the only way a task changes status after insertion. It
//! is a compare-and-set on the stored status, so a worker and a cancel
//! request racing on the same task can never both win.

#[cfg(test)]
pub(crate) mod faulty;
pub mod memory;
pub mod sqlite;

use crate::model::{Agent, AgentId, AgentStatus, Alert, MetricSample, Pool, Task, TaskId, TaskStatus};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, StorageConfig};

/// Aggregate task outcome counts over a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean processing time of completed tasks, in seconds
    pub avg_processing_secs: f64,
}

impl TaskStats {
    /// Completed tasks as a percentage of all tasks (100 when there are none)
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

/// Counts taken from the store in a single consistent read
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub tasks: HashMap<(String, TaskStatus), usize>,
    pub agents: HashMap<(String, AgentStatus), usize>,
    pub taken_at: DateTime<Utc>,
}

impl StoreSnapshot {
    pub fn tasks(&self, domain: &str, status: TaskStatus) -> usize {
        self.tasks
            .get(&(domain.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    /// Tasks with `status` across all domains
    pub fn tasks_with_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .iter()
            .filter(|((_, s), _)| *s == status)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn agents(&self, domain: &str, status: AgentStatus) -> usize {
        self.agents
            .get(&(domain.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_agents(&self, domain: &str) -> usize {
        self.agents
            .iter()
            .filter(|((d, _), _)| d == domain)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn agents_with_status(&self, status: AgentStatus) -> usize {
        self.agents
            .iter()
            .filter(|((_, s), _)| *s == status)
            .map(|(_, count)| count)
            .sum()
    }
}

/// Persistence collaborator.
///
/// Implementations must make `commit_task` atomic (task compare-and-set plus
/// optional agent write) and `snapshot` consistent.
pub trait Store: Send + Sync {
    /// Cheap reachability check
    fn ping(&self) -> Result<()>;

    fn insert_task(&self, task: &Task) -> Result<()>;

    fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Tasks in `status`, oldest first
    fn list_tasks(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Write `task` only if the stored status still equals `expected`, and
    /// write `agent` in the same step. Returns whether the write happened.
    fn commit_task(&self, task: &Task, expected: TaskStatus, agent: Option<&Agent>) -> Result<bool>;

    /// Outcome counts for tasks created at or after `since`
    fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats>;

    fn insert_agent(&self, agent: &Agent) -> Result<()>;

    fn get_agent(&self, id: AgentId) -> Result<Option<Agent>>;

    fn update_agent(&self, agent: &Agent) -> Result<()>;

    /// Returns whether a record was removed
    fn delete_agent(&self, id: AgentId) -> Result<bool>;

    fn list_agents(&self, domain: &str) -> Result<Vec<Agent>>;

    /// Idle agents of `domain`, least recently used first
    fn list_idle_agents(&self, domain: &str) -> Result<Vec<Agent>>;

    fn save_pool(&self, pool: &Pool) -> Result<()>;

    fn load_pools(&self) -> Result<Vec<Pool>>;

    fn record_metrics(&self, samples: &[MetricSample]) -> Result<()>;

    fn record_alerts(&self, alerts: &[Alert]) -> Result<()>;

    /// Most recent alerts, newest first
    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>>;

    fn snapshot(&self) -> Result<StoreSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_aggregation() {
        let mut snapshot = StoreSnapshot::default();
        snapshot.tasks.insert(("general".into(), TaskStatus::Pending), 3);
        snapshot.tasks.insert(("sports".into(), TaskStatus::Pending), 2);
        snapshot.agents.insert(("general".into(), AgentStatus::Idle), 2);
        snapshot.agents.insert(("general".into(), AgentStatus::Failed), 1);

        assert_eq!(snapshot.tasks("general", TaskStatus::Pending), 3);
        assert_eq!(snapshot.tasks("general", TaskStatus::Completed), 0);
        assert_eq!(snapshot.tasks_with_status(TaskStatus::Pending), 5);
        assert_eq!(snapshot.total_agents("general"), 3);
        assert_eq!(snapshot.agents_with_status(AgentStatus::Failed), 1);
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(TaskStats::default().success_rate(), 100.0);
        let stats = TaskStats {
            total: 4,
            completed: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.success_rate(), 75.0);
    }
}
