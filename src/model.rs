// src/model.rs
//! Engine records: tasks, agents, pools, metric samples and alerts.
//!
//! # Task lifecycle
//!
//! ```text
//!            ┌────────────► cancelled ◄───────────┐
//!            │                                    │
//!        pending ──────────► processing ──────────┤
//!            ▲                    │               │
//!            └── (no capacity) ───┘      completed | failed
//! ```
//!
//! Terminal states are immutable. `processing` always carries an assigned
//! agent and a start time.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

pub type TaskId = Ulid;
pub type AgentId = Ulid;

/// Lowest (most urgent) accepted priority
pub const MIN_PRIORITY: u8 = 1;
/// Highest (least urgent) accepted priority
pub const MAX_PRIORITY: u8 = 10;

pub const CANCELLED_MESSAGE: &str = "Task cancelled by user";

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(TaskStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// A unit of work submitted to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub domain: String,
    pub payload: String,

    /// 1 (most urgent) to 10
    pub priority: u8,

    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_agent_id: Option<AgentId>,

    /// Handler output, set on completion
    pub result: Option<String>,

    pub error_message: Option<String>,
}

impl Task {
    /// Create a pending task, validating the priority range
    pub fn new(domain: impl Into<String>, payload: impl Into<String>, priority: u8) -> Result<Self> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(EngineError::validation(format!(
                "priority {} outside [{}, {}]",
                priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }

        Ok(Self {
            id: Ulid::new(),
            domain: domain.into(),
            payload: payload.into(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_agent_id: None,
            result: None,
            error_message: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn guard(&self, next: TaskStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(EngineError::InvalidState(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )))
        }
    }

    /// Copy of this task moved to `processing` on `agent_id`
    pub fn start(&self, agent_id: AgentId) -> Result<Task> {
        self.guard(TaskStatus::Processing)?;
        let mut next = self.clone();
        next.status = TaskStatus::Processing;
        next.assigned_agent_id = Some(agent_id);
        next.started_at = Some(Utc::now());
        Ok(next)
    }

    pub fn complete(&self, result: impl Into<String>) -> Result<Task> {
        self.guard(TaskStatus::Completed)?;
        let mut next = self.clone();
        next.status = TaskStatus::Completed;
        next.result = Some(result.into());
        next.completed_at = Some(Utc::now());
        Ok(next)
    }

    pub fn fail(&self, error_message: impl Into<String>) -> Result<Task> {
        self.guard(TaskStatus::Failed)?;
        let mut next = self.clone();
        next.status = TaskStatus::Failed;
        next.error_message = Some(error_message.into());
        next.completed_at = Some(Utc::now());
        Ok(next)
    }

    pub fn cancel(&self) -> Result<Task> {
        self.guard(TaskStatus::Cancelled)?;
        let mut next = self.clone();
        next.status = TaskStatus::Cancelled;
        next.error_message = Some(CANCELLED_MESSAGE.to_string());
        next.completed_at = Some(Utc::now());
        Ok(next)
    }

    /// Seconds between start and completion, when both are known
    pub fn processing_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Failed,
    Maintenance,
}

string_enum!(AgentStatus {
    Idle => "idle",
    Active => "active",
    Failed => "failed",
    Maintenance => "maintenance",
});

/// A capacity token for one domain.
///
/// Agents are not processes: a worker thread borrows one for the duration
/// of a task and hands it back afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub domain: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,

    /// Task currently holding this agent (only while `active`)
    pub current_task: Option<TaskId>,

    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub last_task_success: Option<bool>,
}

impl Agent {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            name: name.into(),
            domain: domain.into(),
            status: AgentStatus::Idle,
            created_at: now,
            last_used: now,
            current_task: None,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            last_task_success: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    /// Copy of this agent bound to `task_id`
    pub fn occupy(&self, task_id: TaskId) -> Agent {
        let mut next = self.clone();
        next.status = AgentStatus::Active;
        next.current_task = Some(task_id);
        next.last_used = Utc::now();
        next
    }

    /// Copy of this agent returned to idle.
    ///
    /// `success` is `None` when the task never ran (cancelled before its
    /// result was recorded), in which case usage counters are left alone.
    pub fn release(&self, success: Option<bool>) -> Agent {
        let mut next = self.clone();
        next.status = AgentStatus::Idle;
        next.current_task = None;
        next.last_used = Utc::now();
        if let Some(ok) = success {
            next.total_tasks += 1;
            if ok {
                next.successful_tasks += 1;
            } else {
                next.failed_tasks += 1;
            }
            next.last_task_success = Some(ok);
        }
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    Warning,
    Critical,
    Overloaded,
}

string_enum!(PoolHealth {
    Healthy => "healthy",
    Warning => "warning",
    Critical => "critical",
    Overloaded => "overloaded",
});

/// Capacity bucket for one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub domain: String,
    pub min_agents: usize,
    pub max_agents: usize,
    pub target_agents: usize,
    pub current_agents: usize,
    pub active_agents: usize,
    pub auto_scale: bool,
    pub health_status: PoolHealth,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn idle_capacity(&self) -> usize {
        self.current_agents.saturating_sub(self.active_agents)
    }

    /// Fraction of agents busy, as a percentage
    pub fn utilization(&self) -> f64 {
        if self.current_agents == 0 {
            0.0
        } else {
            self.active_agents as f64 / self.current_agents as f64 * 100.0
        }
    }

    /// Check `min ≤ current ≤ max` and `active ≤ current`
    pub fn check_invariants(&self) -> Result<()> {
        if self.current_agents < self.min_agents || self.current_agents > self.max_agents {
            return Err(EngineError::Bounds(format!(
                "pool {} would hold {} agents, allowed [{}, {}]",
                self.domain, self.current_agents, self.min_agents, self.max_agents
            )));
        }
        if self.active_agents > self.current_agents {
            return Err(EngineError::Bounds(format!(
                "pool {} would have {} active of {} agents",
                self.domain, self.active_agents, self.current_agents
            )));
        }
        Ok(())
    }
}

/// One sampled measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    System,
    Agent,
    Database,
    Queue,
}

string_enum!(AlertKind {
    System => "system",
    Agent => "agent",
    Database => "database",
    Queue => "queue",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

string_enum!(AlertSeverity {
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_validation() {
        assert!(Task::new("general", "q", 0).is_err());
        assert!(Task::new("general", "q", 11).is_err());
        assert!(Task::new("general", "q", 1).is_ok());
        assert!(Task::new("general", "q", 10).is_ok());
    }

    #[test]
    fn test_task_lifecycle() {
        let task = Task::new("general", "q", 5).unwrap();
        let agent = Agent::new("general", "general_agent_1");

        let running = task.start(agent.id).unwrap();
        assert_eq!(running.status, TaskStatus::Processing);
        assert_eq!(running.assigned_agent_id, Some(agent.id));
        assert!(running.started_at.is_some());

        let done = running.complete("answer").unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("answer"));
        assert!(done.processing_secs().is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let task = Task::new("general", "q", 5).unwrap();
        let failed = task.start(Ulid::new()).unwrap().fail("boom").unwrap();

        assert!(failed.complete("late").is_err());
        assert!(failed.cancel().is_err());
        assert!(failed.start(Ulid::new()).is_err());

        let cancelled = task.cancel().unwrap();
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(cancelled.start(Ulid::new()).is_err());
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let task = Task::new("general", "q", 5).unwrap();
        assert!(matches!(task.complete("x"), Err(EngineError::InvalidState(_))));
        assert!(task.fail("x").is_err());
    }

    #[test]
    fn test_agent_release_counters() {
        let agent = Agent::new("sports", "sports_agent_1");
        let busy = agent.occupy(Ulid::new());
        assert_eq!(busy.status, AgentStatus::Active);

        let ok = busy.release(Some(true));
        assert!(ok.is_idle());
        assert_eq!(ok.total_tasks, 1);
        assert_eq!(ok.successful_tasks, 1);
        assert!(ok.current_task.is_none());

        let untouched = busy.release(None);
        assert_eq!(untouched.total_tasks, 0);
        assert_eq!(untouched.last_task_success, None);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("processing".parse::<TaskStatus>().unwrap(), TaskStatus::Processing);
        assert_eq!("maintenance".parse::<AgentStatus>().unwrap(), AgentStatus::Maintenance);
        assert!("exploded".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_pool_invariants() {
        let mut pool = Pool {
            domain: "general".into(),
            min_agents: 1,
            max_agents: 3,
            target_agents: 2,
            current_agents: 2,
            active_agents: 1,
            auto_scale: true,
            health_status: PoolHealth::Healthy,
            updated_at: Utc::now(),
        };
        assert!(pool.check_invariants().is_ok());
        assert_eq!(pool.idle_capacity(), 1);
        assert!((pool.utilization() - 50.0).abs() < f64::EPSILON);

        pool.current_agents = 4;
        assert!(pool.check_invariants().is_err());

        pool.current_agents = 1;
        pool.active_agents = 2;
        assert!(pool.check_invariants().is_err());
    }
}
