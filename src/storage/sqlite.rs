// src/storage/sqlite.rs
//! Relational store on SQLite
//!
//! One connection behind a mutex. Timestamps are stored as Unix
//! milliseconds, identifiers as ULID text and enums as their snake_case
//! names. The schema is created on open.

use crate::model::{
    Agent, AgentId, AgentStatus, Alert, AlertKind, AlertSeverity, MetricSample, Pool, PoolHealth,
    Task, TaskId, TaskStatus,
};
use crate::storage::{Store, StoreSnapshot, TaskStats};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use ulid::Ulid;

/// SQLite store configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database file
    pub path: PathBuf,

    /// How long a write waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskflow.db"),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        assigned_agent_id TEXT,
        result TEXT,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        domain TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_used INTEGER NOT NULL,
        current_task TEXT,
        total_tasks INTEGER NOT NULL DEFAULT 0,
        successful_tasks INTEGER NOT NULL DEFAULT 0,
        failed_tasks INTEGER NOT NULL DEFAULT 0,
        last_task_success INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_agents_domain ON agents(domain, status, last_used);

    CREATE TABLE IF NOT EXISTS pools (
        domain TEXT PRIMARY KEY,
        min_agents INTEGER NOT NULL,
        max_agents INTEGER NOT NULL,
        target_agents INTEGER NOT NULL,
        current_agents INTEGER NOT NULL,
        active_agents INTEGER NOT NULL,
        auto_scale INTEGER NOT NULL,
        health_status TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metric_samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        value REAL NOT NULL,
        unit TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_metric_name ON metric_samples(name, timestamp);

    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
"#;

const TASK_COLUMNS: &str = "id, domain, payload, priority, status, created_at, started_at, \
     completed_at, assigned_agent_id, result, error_message";

const AGENT_COLUMNS: &str = "id, name, domain, status, created_at, last_used, current_task, \
     total_tasks, successful_tasks, failed_tasks, last_task_success";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file described by `config`
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::persistence(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(&config.path)
            .map_err(|e| EngineError::persistence(format!("Failed to open database: {}", e)))?;
        conn.busy_timeout(config.busy_timeout)?;

        let store = Self::with_connection(conn)?;
        info!("SQLite store initialized at {:?}", config.path);
        Ok(store)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| EngineError::persistence(format!("Schema creation failed: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn ulid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Ulid> {
    let text: String = row.get(idx)?;
    Ulid::from_string(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_ulid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Ulid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => Ulid::from_string(&text)
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = EngineError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: ulid(row, 0)?,
        domain: row.get(1)?,
        payload: row.get(2)?,
        priority: row.get(3)?,
        status: parsed(row, 4)?,
        created_at: timestamp(row, 5)?,
        started_at: opt_timestamp(row, 6)?,
        completed_at: opt_timestamp(row, 7)?,
        assigned_agent_id: opt_ulid(row, 8)?,
        result: row.get(9)?,
        error_message: row.get(10)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: ulid(row, 0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        status: parsed(row, 3)?,
        created_at: timestamp(row, 4)?,
        last_used: timestamp(row, 5)?,
        current_task: opt_ulid(row, 6)?,
        total_tasks: row.get::<_, i64>(7)? as u64,
        successful_tasks: row.get::<_, i64>(8)? as u64,
        failed_tasks: row.get::<_, i64>(9)? as u64,
        last_task_success: row.get(10)?,
    })
}

fn pool_from_row(row: &Row<'_>) -> rusqlite::Result<Pool> {
    Ok(Pool {
        domain: row.get(0)?,
        min_agents: row.get::<_, i64>(1)? as usize,
        max_agents: row.get::<_, i64>(2)? as usize,
        target_agents: row.get::<_, i64>(3)? as usize,
        current_agents: row.get::<_, i64>(4)? as usize,
        active_agents: row.get::<_, i64>(5)? as usize,
        auto_scale: row.get(6)?,
        health_status: parsed::<PoolHealth>(row, 7)?,
        updated_at: timestamp(row, 8)?,
    })
}

fn upsert_agent(conn: &Connection, agent: &Agent) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            AGENT_COLUMNS
        ),
        params![
            agent.id.to_string(),
            agent.name,
            agent.domain,
            agent.status.as_str(),
            millis(agent.created_at),
            millis(agent.last_used),
            agent.current_task.map(|id| id.to_string()),
            agent.total_tasks as i64,
            agent.successful_tasks as i64,
            agent.failed_tasks as i64,
            agent.last_task_success,
        ],
    )
}

impl Store for SqliteStore {
    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                TASK_COLUMNS
            ),
            params![
                task.id.to_string(),
                task.domain,
                task.payload,
                task.priority,
                task.status.as_str(),
                millis(task.created_at),
                task.started_at.map(millis),
                task.completed_at.map(millis),
                task.assigned_agent_id.map(|id| id.to_string()),
                task.result,
                task.error_message,
            ],
        )
        .map_err(|e| EngineError::persistence(format!("Failed to insert task {}: {}", task.id, e)))?;
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    fn list_tasks(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at, id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![status.as_str()], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn commit_task(&self, task: &Task, expected: TaskStatus, agent: Option<&Agent>) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            r#"
            UPDATE tasks
            SET status = ?1, started_at = ?2, completed_at = ?3,
                assigned_agent_id = ?4, result = ?5, error_message = ?6
            WHERE id = ?7 AND status = ?8
            "#,
            params![
                task.status.as_str(),
                task.started_at.map(millis),
                task.completed_at.map(millis),
                task.assigned_agent_id.map(|id| id.to_string()),
                task.result,
                task.error_message,
                task.id.to_string(),
                expected.as_str(),
            ],
        )?;

        if updated == 0 {
            debug!(task_id = %task.id, expected = %expected, "Commit lost the status race");
            return Ok(false);
        }

        if let Some(agent) = agent {
            upsert_agent(&tx, agent)?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn task_stats(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0),
                   AVG(CASE WHEN status = 'completed' AND started_at IS NOT NULL
                            THEN completed_at - started_at END)
            FROM tasks WHERE created_at >= ?1
            "#,
            params![millis(since)],
            |row| {
                let avg_ms: Option<f64> = row.get(4)?;
                Ok(TaskStats {
                    total: row.get::<_, i64>(0)? as usize,
                    completed: row.get::<_, i64>(1)? as usize,
                    failed: row.get::<_, i64>(2)? as usize,
                    cancelled: row.get::<_, i64>(3)? as usize,
                    avg_processing_secs: avg_ms.unwrap_or(0.0) / 1000.0,
                })
            },
        )?;
        Ok(stats)
    }

    fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        upsert_agent(&conn, agent)?;
        Ok(())
    }

    fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let agent = conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                params![id.to_string()],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    fn update_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        upsert_agent(&conn, agent)?;
        Ok(())
    }

    fn delete_agent(&self, id: AgentId) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM agents WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }

    fn list_agents(&self, domain: &str) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents WHERE domain = ?1 ORDER BY created_at, id",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map(params![domain], agent_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    fn list_idle_agents(&self, domain: &str) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents WHERE domain = ?1 AND status = ?2 ORDER BY last_used, id",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map(params![domain, AgentStatus::Idle.as_str()], agent_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    fn save_pool(&self, pool: &Pool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO pools
                (domain, min_agents, max_agents, target_agents, current_agents,
                 active_agents, auto_scale, health_status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                pool.domain,
                pool.min_agents as i64,
                pool.max_agents as i64,
                pool.target_agents as i64,
                pool.current_agents as i64,
                pool.active_agents as i64,
                pool.auto_scale,
                pool.health_status.as_str(),
                millis(pool.updated_at),
            ],
        )?;
        Ok(())
    }

    fn load_pools(&self) -> Result<Vec<Pool>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT domain, min_agents, max_agents, target_agents, current_agents, \
             active_agents, auto_scale, health_status, updated_at FROM pools ORDER BY domain",
        )?;
        let pools = stmt
            .query_map([], pool_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pools)
    }

    fn record_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_samples (name, value, unit, timestamp) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.name,
                    sample.value,
                    sample.unit,
                    millis(sample.timestamp)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn record_alerts(&self, alerts: &[Alert]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO alerts (kind, severity, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for alert in alerts {
                stmt.execute(params![
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.message,
                    millis(alert.timestamp)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, severity, message, timestamp FROM alerts ORDER BY id DESC LIMIT ?1",
        )?;
        let alerts = stmt
            .query_map(params![limit as i64], |row| {
                Ok(Alert {
                    kind: parsed::<AlertKind>(row, 0)?,
                    severity: parsed::<AlertSeverity>(row, 1)?,
                    message: row.get(2)?,
                    timestamp: timestamp(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut snapshot = StoreSnapshot {
            taken_at: Utc::now(),
            ..Default::default()
        };

        {
            let mut stmt =
                tx.prepare("SELECT domain, status, COUNT(*) FROM tasks GROUP BY domain, status")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    parsed::<TaskStatus>(row, 1)?,
                    row.get::<_, i64>(2)? as usize,
                ))
            })?;
            for row in rows {
                let (domain, status, count) = row?;
                snapshot.tasks.insert((domain, status), count);
            }

            let mut stmt =
                tx.prepare("SELECT domain, status, COUNT(*) FROM agents GROUP BY domain, status")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    parsed::<AgentStatus>(row, 1)?,
                    row.get::<_, i64>(2)? as usize,
                ))
            })?;
            for row in rows {
                let (domain, status, count) = row?;
                snapshot.agents.insert((domain, status), count);
            }
        }

        tx.commit()?;
        Ok(snapshot)
    }
}
