// src/runtime/agent_pool.rs
//! Per-domain agent capacity management
//!
//! Each domain owns a pool of agents (capacity tokens). A worker borrows an
//! idle agent for the duration of a task and hands it back afterwards; the
//! control loop grows or shrinks the pool by at most one agent per tick.
//!
//! # Architecture
//!
//! ```text
//! AgentPoolManager
//! ├─ healthcare: Mutex<Pool>  ─┐
//! ├─ financial:  Mutex<Pool>   │  pool lock held across the
//! ├─ sports:     Mutex<Pool>   ├─ store write, so assignment, release,
//! ├─ business:   Mutex<Pool>   │  autoscale and manual scaling of one
//! └─ general:    Mutex<Pool>  ─┘  domain never interleave
//! ```
//!
//! Lock order is always pool → store. Every mutation is applied to a copy
//! of the pool, checked against `min ≤ current ≤ max` and
//! `active ≤ current`, persisted, and only then published.

use crate::model::{Agent, AgentId, AgentStatus, Pool, PoolHealth, Task, TaskId, TaskStatus};
use crate::observability::{POOL_ACTIVE_AGENTS, POOL_CURRENT_AGENTS, POOL_SCALE_EVENTS};
use crate::storage::{Store, StoreSnapshot};
use crate::utils::config::PoolsConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Direction of a manual scale request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Up => f.write_str("up"),
            ScaleDirection::Down => f.write_str("down"),
        }
    }
}

/// Outcome of evaluating one pool on an autoscale tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    /// No action needed.
    None,
    /// Add one agent.
    ScaleUp { reason: String },
    /// Remove one idle agent.
    ScaleDown { reason: String },
}

/// Decide how a pool should move given its backlog.
///
/// `pending` and `idle` must come from the same consistent read as the
/// pool counters.
pub fn decide(pool: &Pool, pending: usize, idle: usize) -> ScalingDecision {
    if pending > pool.current_agents * 2 && pool.current_agents < pool.max_agents {
        ScalingDecision::ScaleUp {
            reason: format!(
                "{} pending tasks exceed twice the {} current agents",
                pending, pool.current_agents
            ),
        }
    } else if pending == 0 && pool.current_agents > pool.min_agents && idle > 1 {
        ScalingDecision::ScaleDown {
            reason: format!("no pending tasks and {} idle agents", idle),
        }
    } else {
        ScalingDecision::None
    }
}

/// Result of asking for an agent to run a task
#[derive(Debug, Clone)]
pub enum Assignment {
    /// The task is now `processing` on `agent`
    Assigned {
        task: Task,
        agent: Agent,
        /// An agent had to be created to serve this task
        scaled_up: bool,
    },
    /// No idle agent and the pool is at its maximum
    NoCapacity,
    /// The task left `pending` (cancelled) before it could be assigned
    Stale,
}

/// A pool change applied by an autoscale tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingEvent {
    pub domain: String,
    pub decision: ScalingDecision,
    pub current_agents: usize,
}

/// A task transition the store refused; replayed on later ticks
#[derive(Debug, Clone)]
struct DeferredCommit {
    task: Task,
    expected: TaskStatus,
    success: Option<bool>,
}

pub struct AgentPoolManager {
    store: Arc<dyn Store>,

    /// Fixed at construction; only the values behind each lock change
    pools: BTreeMap<String, Mutex<Pool>>,

    /// Outcomes whose commit failed; their agents stay bound until replayed
    deferred: DashMap<TaskId, DeferredCommit>,
}

fn agent_number(agent: &Agent) -> u64 {
    agent
        .name
        .rsplit('_')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

impl AgentPoolManager {
    /// Build pools for every configured domain.
    ///
    /// Call [`initialize`](Self::initialize) before use to reconcile the
    /// store's agent records with the configured bounds.
    pub fn new(store: Arc<dyn Store>, config: &PoolsConfig) -> Self {
        let now = Utc::now();
        let pools = config
            .iter()
            .map(|(domain, pool)| {
                let record = Pool {
                    domain: domain.clone(),
                    min_agents: pool.min_agents,
                    max_agents: pool.max_agents,
                    target_agents: pool.target_agents,
                    current_agents: 0,
                    active_agents: 0,
                    auto_scale: pool.auto_scale,
                    health_status: PoolHealth::Healthy,
                    updated_at: now,
                };
                (domain.clone(), Mutex::new(record))
            })
            .collect();

        Self {
            store,
            pools,
            deferred: DashMap::new(),
        }
    }

    /// Bring every pool to a consistent startup state.
    ///
    /// Agents left `active` by a previous process return to `idle`, excess
    /// idle agents above `max_agents` are removed, and pools below their
    /// clamped target are provisioned.
    pub fn initialize(&self) -> Result<()> {
        for (domain, lock) in &self.pools {
            let mut pool = lock.lock();
            let mut agents = self.store.list_agents(domain)?;

            for agent in agents.iter_mut().filter(|a| a.status == AgentStatus::Active) {
                warn!(agent = %agent.name, "Resetting agent left active by a previous run");
                *agent = agent.release(None);
                self.store.update_agent(agent)?;
            }

            let mut next = pool.clone();
            next.current_agents = agents.len();
            next.active_agents = 0;

            if next.current_agents > next.max_agents {
                let excess = next.current_agents - next.max_agents;
                let removed = self.remove_idle_agents(&mut next, excess)?;
                if removed < excess {
                    warn!(
                        "Pool {} holds {} agents above its maximum that are not idle",
                        domain,
                        excess - removed
                    );
                }
            }

            let initial = next
                .target_agents
                .clamp(next.min_agents, next.max_agents.max(next.min_agents));
            if next.current_agents < initial {
                let missing = initial - next.current_agents;
                self.add_agents(&mut next, missing)?;
            }

            next.updated_at = Utc::now();
            self.publish(&mut pool, next)?;

            info!(
                "Initialized {} pool with {} agents (min {}, max {})",
                domain, pool.current_agents, pool.min_agents, pool.max_agents
            );
        }
        Ok(())
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.pools.contains_key(domain)
    }

    /// Copy of one pool's current record
    pub fn pool(&self, domain: &str) -> Option<Pool> {
        self.pools.get(domain).map(|lock| lock.lock().clone())
    }

    /// Copies of every pool, ordered by domain
    pub fn pools(&self) -> Vec<Pool> {
        self.pools.values().map(|lock| lock.lock().clone()).collect()
    }

    fn lock_for(&self, domain: &str) -> Result<&Mutex<Pool>> {
        self.pools
            .get(domain)
            .ok_or_else(|| EngineError::validation(format!("unknown domain '{}'", domain)))
    }

    /// Check invariants on `next`, persist it and make it visible
    fn publish(&self, pool: &mut Pool, mut next: Pool) -> Result<()> {
        next.check_invariants()?;
        next.updated_at = Utc::now();
        self.store.save_pool(&next)?;

        gauge!(POOL_CURRENT_AGENTS, "domain" => next.domain.clone()).set(next.current_agents as f64);
        gauge!(POOL_ACTIVE_AGENTS, "domain" => next.domain.clone()).set(next.active_agents as f64);

        *pool = next;
        Ok(())
    }

    /// Create `count` agents in the store and count them on `pool`
    fn add_agents(&self, pool: &mut Pool, count: usize) -> Result<Vec<Agent>> {
        let existing = self.store.list_agents(&pool.domain)?;
        let mut number = existing.iter().map(agent_number).max().unwrap_or(0);
        let mut created = Vec::with_capacity(count);

        for _ in 0..count {
            number += 1;
            let agent = Agent::new(pool.domain.clone(), format!("{}_agent_{}", pool.domain, number));
            self.store.insert_agent(&agent)?;
            debug!(agent = %agent.name, "Created agent");
            pool.current_agents += 1;
            created.push(agent);
        }
        Ok(created)
    }

    /// Delete up to `count` idle agents, least recently used first
    fn remove_idle_agents(&self, pool: &mut Pool, count: usize) -> Result<usize> {
        let idle = self.store.list_idle_agents(&pool.domain)?;
        let mut removed = 0;

        for agent in idle.into_iter().take(count) {
            if self.store.delete_agent(agent.id)? {
                debug!(agent = %agent.name, "Removed idle agent");
                pool.current_agents = pool.current_agents.saturating_sub(1);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Bind an idle agent of `task.domain` to `task`.
    ///
    /// Takes the least recently used idle agent, or creates one when the
    /// pool is below its maximum. The task moves to `processing` and the
    /// agent to `active` in a single store commit that only succeeds while
    /// the task is still `pending`.
    pub fn assign(&self, task: &Task) -> Result<Assignment> {
        let lock = self.lock_for(&task.domain)?;
        let mut pool = lock.lock();
        let mut next = pool.clone();

        let idle = self.store.list_idle_agents(&task.domain)?.into_iter().next();
        let (agent, scaled_up) = match idle {
            Some(agent) => (agent, false),
            None if next.current_agents < next.max_agents => {
                let mut created = self.add_agents(&mut next, 1)?;
                match created.pop() {
                    Some(agent) => {
                        counter!(POOL_SCALE_EVENTS, "domain" => task.domain.clone(), "direction" => "up")
                            .increment(1);
                        info!(
                            task_id = %task.id,
                            "Scaled {} pool up to {} agents on demand",
                            task.domain,
                            next.current_agents
                        );
                        (agent, true)
                    }
                    None => return Ok(Assignment::NoCapacity),
                }
            }
            None => return Ok(Assignment::NoCapacity),
        };

        let running = task.start(agent.id)?;
        let busy = agent.occupy(task.id);

        if !self.store.commit_task(&running, TaskStatus::Pending, Some(&busy))? {
            if scaled_up {
                self.publish(&mut pool, next)?;
            }
            return Ok(Assignment::Stale);
        }

        next.active_agents += 1;
        self.publish(&mut pool, next)?;

        Ok(Assignment::Assigned {
            task: running,
            agent: busy,
            scaled_up,
        })
    }

    /// Commit a task transition out of `expected`, releasing its agent.
    ///
    /// The agent is only released if it is still bound to this task, so a
    /// cancel and a worker finishing the same task cannot release it twice.
    /// `success` feeds the agent's usage counters (`None` leaves them).
    /// Returns whether the transition was applied.
    pub fn commit_transition(
        &self,
        next_task: &Task,
        expected: TaskStatus,
        success: Option<bool>,
    ) -> Result<bool> {
        let lock = self.lock_for(&next_task.domain)?;
        let mut pool = lock.lock();

        let released = match next_task.assigned_agent_id {
            Some(agent_id) => self
                .store
                .get_agent(agent_id)?
                .filter(|agent| agent.current_task == Some(next_task.id))
                .map(|agent| agent.release(success)),
            None => None,
        };

        let applied = self.store.commit_task(next_task, expected, released.as_ref())?;

        if applied && released.is_some() {
            let mut next = pool.clone();
            next.active_agents = next.active_agents.saturating_sub(1);
            self.publish(&mut pool, next)?;
        }

        Ok(applied)
    }

    /// Keep a transition the store could not take for [`retry_deferred`](Self::retry_deferred)
    pub fn defer_commit(&self, task: Task, expected: TaskStatus, success: Option<bool>) {
        warn!(task_id = %task.id, "Deferring task commit to the next tick");
        self.deferred.insert(
            task.id,
            DeferredCommit {
                task,
                expected,
                success,
            },
        );
    }

    pub fn deferred_commits(&self) -> usize {
        self.deferred.len()
    }

    /// Replay deferred transitions; returns how many were settled.
    ///
    /// A replay the store answers either way is settled: applied, or
    /// superseded because the task already left `expected`. Errors keep the
    /// entry for the next attempt.
    pub fn retry_deferred(&self) -> usize {
        let waiting: Vec<DeferredCommit> =
            self.deferred.iter().map(|entry| entry.value().clone()).collect();
        let mut settled = 0;

        for commit in waiting {
            match self.commit_transition(&commit.task, commit.expected, commit.success) {
                Ok(applied) => {
                    self.deferred.remove(&commit.task.id);
                    settled += 1;
                    if applied {
                        info!(task_id = %commit.task.id, "Deferred task commit applied");
                    } else {
                        debug!(task_id = %commit.task.id, "Deferred task commit superseded");
                    }
                }
                Err(e) => warn!(task_id = %commit.task.id, "Deferred task commit failed again: {}", e),
            }
        }
        settled
    }

    /// Recount `pool` from the store's agent records; returns the idle count
    fn recount(&self, pool: &mut Pool) -> Result<usize> {
        let agents = self.store.list_agents(&pool.domain)?;
        let active = agents.iter().filter(|a| a.status == AgentStatus::Active).count();
        let idle = agents.iter().filter(|a| a.is_idle()).count();

        if pool.current_agents != agents.len() || pool.active_agents != active {
            warn!(
                "Pool {} counters drifted (current {} → {}, active {} → {})",
                pool.domain,
                pool.current_agents,
                agents.len(),
                pool.active_agents,
                active
            );
            pool.current_agents = agents.len();
            pool.active_agents = active;
        }
        Ok(idle)
    }

    /// Re-align every pool's counters with the store
    pub fn reconcile(&self) -> Result<()> {
        for lock in self.pools.values() {
            let mut pool = lock.lock();
            let mut next = pool.clone();
            self.recount(&mut next)?;
            if next != *pool {
                // Drift is recorded even if it breaks the bounds; autoscale
                // and manual scaling then move the pool back inside them.
                next.updated_at = Utc::now();
                self.store.save_pool(&next)?;
                *pool = next;
            }
        }
        Ok(())
    }

    /// Run one autoscale tick over every pool with `auto_scale` enabled.
    ///
    /// Pending counts come from `snapshot`; agent counts are re-read under
    /// each pool's lock. A failure in one pool is logged and does not stop
    /// the others.
    pub fn autoscale(&self, snapshot: &StoreSnapshot) -> Vec<ScalingEvent> {
        let mut events = Vec::new();

        for (domain, lock) in &self.pools {
            let mut pool = lock.lock();
            if !pool.auto_scale {
                continue;
            }

            match self.autoscale_pool(&mut pool, snapshot.tasks(domain, TaskStatus::Pending)) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("Autoscale of {} pool failed: {}", domain, e),
            }
        }

        events
    }

    fn autoscale_pool(&self, pool: &mut Pool, pending: usize) -> Result<Option<ScalingEvent>> {
        let mut next = pool.clone();
        let idle = self.recount(&mut next)?;
        let decision = decide(&next, pending, idle);

        match &decision {
            ScalingDecision::None => {
                if next != *pool {
                    next.updated_at = Utc::now();
                    self.store.save_pool(&next)?;
                    *pool = next;
                }
                return Ok(None);
            }
            ScalingDecision::ScaleUp { reason } => {
                self.add_agents(&mut next, 1)?;
                info!("Scaling {} pool up to {}: {}", pool.domain, next.current_agents, reason);
            }
            ScalingDecision::ScaleDown { reason } => {
                if self.remove_idle_agents(&mut next, 1)? == 0 {
                    return Ok(None);
                }
                info!("Scaling {} pool down to {}: {}", pool.domain, next.current_agents, reason);
            }
        }

        let direction = match decision {
            ScalingDecision::ScaleUp { .. } => "up",
            _ => "down",
        };
        counter!(POOL_SCALE_EVENTS, "domain" => pool.domain.clone(), "direction" => direction)
            .increment(1);

        self.publish(pool, next)?;
        Ok(Some(ScalingEvent {
            domain: pool.domain.clone(),
            decision,
            current_agents: pool.current_agents,
        }))
    }

    /// Apply an explicit scale request; returns the new agent count.
    ///
    /// Fails with `Bounds` when the result would leave `[min, max]` and
    /// with `Capacity` when fewer than `count` agents are idle.
    pub fn scale_pool(&self, domain: &str, direction: ScaleDirection, count: usize) -> Result<usize> {
        if count == 0 {
            return Err(EngineError::validation("scale count must be at least 1"));
        }

        let lock = self.lock_for(domain)?;
        let mut pool = lock.lock();
        let mut next = pool.clone();

        match direction {
            ScaleDirection::Up => {
                let target = next.current_agents + count;
                if target > next.max_agents {
                    return Err(EngineError::Bounds(format!(
                        "scaling {} up by {} gives {} agents, maximum is {}",
                        domain, count, target, next.max_agents
                    )));
                }
                self.add_agents(&mut next, count)?;
            }
            ScaleDirection::Down => {
                let target = next.current_agents.checked_sub(count).filter(|t| *t >= next.min_agents);
                if target.is_none() {
                    return Err(EngineError::Bounds(format!(
                        "scaling {} down by {} from {} agents goes below minimum {}",
                        domain, count, next.current_agents, next.min_agents
                    )));
                }

                let idle = self.store.list_idle_agents(domain)?.len();
                if idle < count {
                    return Err(EngineError::Capacity(format!(
                        "{} pool has {} idle agents, {} requested for removal",
                        domain, idle, count
                    )));
                }
                self.remove_idle_agents(&mut next, count)?;
            }
        }

        counter!(POOL_SCALE_EVENTS, "domain" => domain.to_string(), "direction" => direction.to_string())
            .increment(count as u64);
        self.publish(&mut pool, next)?;

        info!("Manually scaled {} pool {} by {} to {}", domain, direction, count, pool.current_agents);
        Ok(pool.current_agents)
    }

    /// Operator override of an agent's status.
    ///
    /// Moves an agent between `idle`, `failed` and `maintenance`. Active
    /// agents belong to a running task and are never touched.
    pub fn set_agent_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<Agent> {
        if status == AgentStatus::Active {
            return Err(EngineError::InvalidState(
                "agents only become active by taking a task".into(),
            ));
        }

        let domain = self
            .store
            .get_agent(agent_id)?
            .map(|agent| agent.domain)
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", agent_id)))?;

        let lock = self.lock_for(&domain)?;
        let _pool = lock.lock();

        let mut agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", agent_id)))?;
        if agent.status == AgentStatus::Active {
            return Err(EngineError::InvalidState(format!(
                "agent {} is running task {:?}",
                agent.name, agent.current_task
            )));
        }

        agent.status = status;
        self.store.update_agent(&agent)?;
        info!(agent = %agent.name, status = %status, "Agent status changed");
        Ok(agent)
    }

    pub fn set_health(&self, domain: &str, health: PoolHealth) -> Result<()> {
        let lock = self.lock_for(domain)?;
        let mut pool = lock.lock();
        if pool.health_status == health {
            return Ok(());
        }

        let mut next = pool.clone();
        next.health_status = health;
        next.updated_at = Utc::now();
        self.store.save_pool(&next)?;
        *pool = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::utils::config::PoolConfig;

    fn manager(min: usize, max: usize, target: usize) -> (Arc<MemoryStore>, AgentPoolManager) {
        let store = Arc::new(MemoryStore::new());
        let mut pools = BTreeMap::new();
        pools.insert("general".to_string(), PoolConfig::new(min, max, target));
        let manager = AgentPoolManager::new(store.clone(), &PoolsConfig(pools));
        manager.initialize().unwrap();
        (store, manager)
    }

    fn pending_task(store: &MemoryStore) -> Task {
        let task = Task::new("general", "q", 5).unwrap();
        store.insert_task(&task).unwrap();
        task
    }

    fn snapshot_with_pending(pending: usize) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();
        snapshot.tasks.insert(("general".into(), TaskStatus::Pending), pending);
        snapshot
    }

    #[test]
    fn test_initialize_provisions_clamped_target() {
        let (store, manager) = manager(2, 5, 1);
        let pool = manager.pool("general").unwrap();
        assert_eq!(pool.current_agents, 2);
        assert_eq!(store.list_agents("general").unwrap().len(), 2);
        assert_eq!(store.load_pools().unwrap()[0].current_agents, 2);

        let (_, capped) = self::manager(1, 3, 9);
        assert_eq!(capped.pool("general").unwrap().current_agents, 3);
    }

    #[test]
    fn test_initialize_resets_active_agents() {
        let store = Arc::new(MemoryStore::new());
        let stuck = Agent::new("general", "general_agent_1").occupy(ulid::Ulid::new());
        store.insert_agent(&stuck).unwrap();

        let mut pools = BTreeMap::new();
        pools.insert("general".to_string(), PoolConfig::new(1, 3, 1));
        let manager = AgentPoolManager::new(store.clone(), &PoolsConfig(pools));
        manager.initialize().unwrap();

        let agent = store.get_agent(stuck.id).unwrap().unwrap();
        assert!(agent.is_idle());
        assert_eq!(manager.pool("general").unwrap().active_agents, 0);
        assert_eq!(manager.pool("general").unwrap().current_agents, 1);
    }

    #[test]
    fn test_decide() {
        let (_, manager) = manager(1, 5, 1);
        let pool = manager.pool("general").unwrap();

        assert!(matches!(decide(&pool, 3, 1), ScalingDecision::ScaleUp { .. }));
        assert_eq!(decide(&pool, 2, 1), ScalingDecision::None);

        let mut big = pool.clone();
        big.current_agents = 3;
        assert!(matches!(decide(&big, 0, 3), ScalingDecision::ScaleDown { .. }));
        assert_eq!(decide(&big, 0, 1), ScalingDecision::None);

        big.current_agents = 5;
        assert_eq!(decide(&big, 100, 0), ScalingDecision::None);
    }

    #[test]
    fn test_assign_and_release() {
        let (store, manager) = manager(1, 1, 1);
        let task = pending_task(&store);

        let (running, agent) = match manager.assign(&task).unwrap() {
            Assignment::Assigned { task, agent, scaled_up } => {
                assert!(!scaled_up);
                (task, agent)
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(manager.pool("general").unwrap().active_agents, 1);

        // Pool at max with its only agent busy
        let second = pending_task(&store);
        assert!(matches!(manager.assign(&second).unwrap(), Assignment::NoCapacity));

        let done = running.complete("ok").unwrap();
        assert!(manager.commit_transition(&done, TaskStatus::Processing, Some(true)).unwrap());

        let pool = manager.pool("general").unwrap();
        assert_eq!(pool.active_agents, 0);
        assert_eq!(pool.current_agents, 1);

        let released = store.get_agent(agent.id).unwrap().unwrap();
        assert!(released.is_idle());
        assert_eq!(released.successful_tasks, 1);
    }

    #[test]
    fn test_assign_scales_up_on_demand() {
        let (store, manager) = manager(1, 3, 1);
        let first = pending_task(&store);
        let second = pending_task(&store);

        assert!(matches!(manager.assign(&first).unwrap(), Assignment::Assigned { scaled_up: false, .. }));
        assert!(matches!(manager.assign(&second).unwrap(), Assignment::Assigned { scaled_up: true, .. }));

        let pool = manager.pool("general").unwrap();
        assert_eq!(pool.current_agents, 2);
        assert_eq!(pool.active_agents, 2);
    }

    #[test]
    fn test_assign_cancelled_task_is_stale() {
        let (store, manager) = manager(1, 3, 1);
        let task = pending_task(&store);
        store.commit_task(&task.cancel().unwrap(), TaskStatus::Pending, None).unwrap();

        assert!(matches!(manager.assign(&task).unwrap(), Assignment::Stale));
        assert_eq!(manager.pool("general").unwrap().active_agents, 0);
        assert_eq!(store.list_idle_agents("general").unwrap().len(), 1);
    }

    #[test]
    fn test_release_happens_once() {
        let (store, manager) = manager(1, 2, 1);
        let task = pending_task(&store);
        let running = match manager.assign(&task).unwrap() {
            Assignment::Assigned { task, .. } => task,
            other => panic!("unexpected {:?}", other),
        };

        let cancelled = running.cancel().unwrap();
        assert!(manager.commit_transition(&cancelled, TaskStatus::Processing, None).unwrap());

        // The worker's late result loses the race and must not release again
        let late = running.complete("late").unwrap();
        assert!(!manager.commit_transition(&late, TaskStatus::Processing, Some(true)).unwrap());

        let pool = manager.pool("general").unwrap();
        assert_eq!(pool.active_agents, 0);
        let agent = store.list_agents("general").unwrap().remove(0);
        assert_eq!(agent.total_tasks, 0);
    }

    #[test]
    fn test_autoscale_up_then_down_to_min() {
        let (_, manager) = manager(1, 5, 1);

        let events = manager.autoscale(&snapshot_with_pending(3));
        assert_eq!(events.len(), 1);
        assert_eq!(manager.pool("general").unwrap().current_agents, 2);

        manager.scale_pool("general", ScaleDirection::Up, 1).unwrap();
        assert_eq!(manager.pool("general").unwrap().current_agents, 3);

        let empty = snapshot_with_pending(0);
        manager.autoscale(&empty);
        assert_eq!(manager.pool("general").unwrap().current_agents, 2);
        manager.autoscale(&empty);
        assert_eq!(manager.pool("general").unwrap().current_agents, 1);
        assert!(manager.autoscale(&empty).is_empty());
        assert_eq!(manager.pool("general").unwrap().current_agents, 1);
    }

    #[test]
    fn test_scale_pool_errors() {
        let (store, manager) = manager(1, 3, 2);

        assert!(matches!(
            manager.scale_pool("general", ScaleDirection::Up, 2),
            Err(EngineError::Bounds(_))
        ));
        assert!(matches!(
            manager.scale_pool("general", ScaleDirection::Down, 2),
            Err(EngineError::Bounds(_))
        ));
        assert!(matches!(
            manager.scale_pool("unknown", ScaleDirection::Up, 1),
            Err(EngineError::Validation(_))
        ));

        // Both agents busy: nothing idle to remove
        for _ in 0..2 {
            let task = pending_task(&store);
            manager.assign(&task).unwrap();
        }
        assert!(matches!(
            manager.scale_pool("general", ScaleDirection::Down, 1),
            Err(EngineError::Capacity(_))
        ));

        let pool = manager.pool("general").unwrap();
        assert_eq!(pool.current_agents, 2);
        assert!(pool.check_invariants().is_ok());
    }

    #[test]
    fn test_set_agent_status() {
        let (store, manager) = manager(1, 3, 2);
        let agents = store.list_agents("general").unwrap();

        let failed = manager.set_agent_status(agents[0].id, AgentStatus::Failed).unwrap();
        assert_eq!(failed.status, AgentStatus::Failed);
        assert_eq!(store.list_idle_agents("general").unwrap().len(), 1);

        assert!(matches!(
            manager.set_agent_status(agents[1].id, AgentStatus::Active),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            manager.set_agent_status(ulid::Ulid::new(), AgentStatus::Idle),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_reconcile_fixes_drift() {
        let (store, manager) = manager(1, 5, 2);
        store.insert_agent(&Agent::new("general", "general_agent_9")).unwrap();

        manager.reconcile().unwrap();
        assert_eq!(manager.pool("general").unwrap().current_agents, 3);
    }
}
