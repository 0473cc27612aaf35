// src/storage/memory.rs
//! In-process store
//!
//! All records live behind a single `RwLock`, which makes `commit_task`
//! atomic and `snapshot` consistent for free. Metric and alert history is
//! bounded so a long-running engine does not grow without limit.

use crate::model::{Agent, AgentId, Alert, MetricSample, Pool, Task, TaskId, TaskStatus, AgentStatus};
use crate::storage::{Store, StoreSnapshot, TaskStats};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// Default number of metric samples retained
const DEFAULT_METRIC_HISTORY: usize = 10_000;

/// Default number of alerts retained
const DEFAULT_ALERT_HISTORY: usize = 1_000;

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    agents: HashMap<AgentId, Agent>,
    pools: HashMap<String, Pool>,
    metrics: VecDeque<MetricSample>,
    alerts: VecDeque<Alert>,
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
    metric_history: usize,
    alert_history: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_METRIC_HISTORY, DEFAULT_ALERT_HISTORY)
    }

    pub fn with_history(metric_history: usize, alert_history: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            metric_history,
            alert_history,
        }
    }

    /// Retained metric samples named `name`, oldest first
    pub fn metric_history(&self, name: &str) -> Vec<MetricSample> {
        self.state
            .read()
            .metrics
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn insert_task(&self, task: &Task) -> Result<()> {
        self.state.write().tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.state.read().tasks.get(&id).cloned())
    }

    fn list_tasks(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    fn commit_task(&self, task: &Task, expected: TaskStatus, agent: Option<&Agent>) -> Result<bool> {
        let mut state = self.state.write();

        match state.tasks.get(&task.id) {
            Some(stored) if stored.status == expected => {}
            _ => return Ok(false),
        }

        state.tasks.insert(task.id, task.clone());
        if let Some(agent) = agent {
            state.agents.insert(agent.id, agent.clone());
        }
        Ok(true)
    }

    fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        let state = self.state.read();
        let mut stats = TaskStats::default();
        let mut processing_total = 0.0;

        for task in state.tasks.values().filter(|t| t.created_at >= since) {
            stats.total += 1;
            match task.status {
                TaskStatus::Completed => {
                    stats.completed += 1;
                    processing_total += task.processing_secs().unwrap_or(0.0);
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
        }

        if stats.completed > 0 {
            stats.avg_processing_secs = processing_total / stats.completed as f64;
        }
        Ok(stats)
    }

    fn insert_agent(&self, agent: &Agent) -> Result<()> {
        self.state.write().agents.insert(agent.id, agent.clone());
        Ok(())
    }

    fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.state.read().agents.get(&id).cloned())
    }

    fn update_agent(&self, agent: &Agent) -> Result<()> {
        self.state.write().agents.insert(agent.id, agent.clone());
        Ok(())
    }

    fn delete_agent(&self, id: AgentId) -> Result<bool> {
        Ok(self.state.write().agents.remove(&id).is_some())
    }

    fn list_agents(&self, domain: &str) -> Result<Vec<Agent>> {
        let state = self.state.read();
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.domain == domain)
            .cloned()
            .collect();
        agents.sort_by_key(|a| (a.created_at, a.id));
        Ok(agents)
    }

    fn list_idle_agents(&self, domain: &str) -> Result<Vec<Agent>> {
        let state = self.state.read();
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.domain == domain && a.status == AgentStatus::Idle)
            .cloned()
            .collect();
        agents.sort_by_key(|a| (a.last_used, a.id));
        Ok(agents)
    }

    fn save_pool(&self, pool: &Pool) -> Result<()> {
        self.state.write().pools.insert(pool.domain.clone(), pool.clone());
        Ok(())
    }

    fn load_pools(&self) -> Result<Vec<Pool>> {
        let mut pools: Vec<Pool> = self.state.read().pools.values().cloned().collect();
        pools.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(pools)
    }

    fn record_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        let mut state = self.state.write();
        state.metrics.extend(samples.iter().cloned());
        while state.metrics.len() > self.metric_history {
            state.metrics.pop_front();
        }
        Ok(())
    }

    fn record_alerts(&self, alerts: &[Alert]) -> Result<()> {
        let mut state = self.state.write();
        state.alerts.extend(alerts.iter().cloned());
        while state.alerts.len() > self.alert_history {
            state.alerts.pop_front();
        }
        Ok(())
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        Ok(self.state.read().alerts.iter().rev().take(limit).cloned().collect())
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let state = self.state.read();
        let mut snapshot = StoreSnapshot {
            taken_at: Utc::now(),
            ..Default::default()
        };

        for task in state.tasks.values() {
            *snapshot
                .tasks
                .entry((task.domain.clone(), task.status))
                .or_insert(0) += 1;
        }
        for agent in state.agents.values() {
            *snapshot
                .agents
                .entry((agent.domain.clone(), agent.status))
                .or_insert(0) += 1;
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertKind, AlertSeverity};

    #[test]
    fn test_commit_is_compare_and_set() {
        let store = MemoryStore::new();
        let task = Task::new("general", "q", 5).unwrap();
        store.insert_task(&task).unwrap();

        let agent = Agent::new("general", "general_agent_1");
        store.insert_agent(&agent).unwrap();

        let running = task.start(agent.id).unwrap();
        let busy = agent.occupy(task.id);
        assert!(store.commit_task(&running, TaskStatus::Pending, Some(&busy)).unwrap());

        // A second writer still expecting `pending` loses
        let cancelled = task.cancel().unwrap();
        assert!(!store.commit_task(&cancelled, TaskStatus::Pending, None).unwrap());

        let stored = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        let stored_agent = store.get_agent(agent.id).unwrap().unwrap();
        assert_eq!(stored_agent.current_task, Some(task.id));
    }

    #[test]
    fn test_commit_unknown_task() {
        let store = MemoryStore::new();
        let task = Task::new("general", "q", 5).unwrap();
        assert!(!store.commit_task(&task, TaskStatus::Pending, None).unwrap());
    }

    #[test]
    fn test_idle_agents_least_recently_used_first() {
        let store = MemoryStore::new();
        let first = Agent::new("sports", "sports_agent_1");
        let mut second = Agent::new("sports", "sports_agent_2");
        second.last_used = first.last_used - chrono::Duration::seconds(30);
        let busy = Agent::new("sports", "sports_agent_3").occupy(ulid::Ulid::new());

        store.insert_agent(&first).unwrap();
        store.insert_agent(&second).unwrap();
        store.insert_agent(&busy).unwrap();

        let idle = store.list_idle_agents("sports").unwrap();
        assert_eq!(idle.len(), 2);
        assert_eq!(idle[0].id, second.id);
    }

    #[test]
    fn test_snapshot_counts() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.insert_task(&Task::new("general", "q", 5).unwrap()).unwrap();
        }
        store.insert_task(&Task::new("financial", "q", 1).unwrap()).unwrap();
        store.insert_agent(&Agent::new("general", "general_agent_1")).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.tasks("general", TaskStatus::Pending), 3);
        assert_eq!(snapshot.tasks("financial", TaskStatus::Pending), 1);
        assert_eq!(snapshot.agents("general", AgentStatus::Idle), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let store = MemoryStore::with_history(3, 2);
        let samples: Vec<MetricSample> = (0..5)
            .map(|i| MetricSample::new("cpu_usage_percent", i as f64, "percent"))
            .collect();
        store.record_metrics(&samples).unwrap();

        let history = store.metric_history("cpu_usage_percent");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, 2.0);

        let alerts: Vec<Alert> = (0..3)
            .map(|i| Alert::new(AlertKind::System, AlertSeverity::Warning, format!("alert {}", i)))
            .collect();
        store.record_alerts(&alerts).unwrap();
        let recent = store.recent_alerts(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "alert 2");
    }

    #[test]
    fn test_task_stats() {
        let store = MemoryStore::new();
        let since = Utc::now() - chrono::Duration::hours(1);

        let done = Task::new("general", "a", 5).unwrap();
        store.insert_task(&done).unwrap();
        let running = done.start(ulid::Ulid::new()).unwrap();
        store.commit_task(&running, TaskStatus::Pending, None).unwrap();
        store.commit_task(&running.complete("ok").unwrap(), TaskStatus::Processing, None).unwrap();

        let failed = Task::new("general", "b", 5).unwrap();
        store.insert_task(&failed).unwrap();
        let running = failed.start(ulid::Ulid::new()).unwrap();
        store.commit_task(&running, TaskStatus::Pending, None).unwrap();
        store.commit_task(&running.fail("boom").unwrap(), TaskStatus::Processing, None).unwrap();

        let stats = store.task_stats(since).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate(), 50.0);
    }
}
