// src/runtime/worker_pool.rs
//! Fixed-size pool of worker threads
//!
//! Each worker pops the most urgent task, borrows an agent for its domain,
//! runs the domain handler and commits the outcome. Handler failures and
//! store errors are handled per task; nothing unwinds past the loop.
//!
//! ```text
//! pop ─► load task ─► assign agent ─┬─► invoke handler ─► commit ─► release agent
//!                                   ├─► no capacity ─► requeue + back off
//!                                   └─► cancelled ─► skip
//! ```

use crate::handler::{invoke_guarded, DomainHandler};
use crate::model::{Task, TaskId, TaskStatus};
use crate::observability::{
    QUEUE_DEPTH, STORE_ERRORS, TASKS_COMPLETED, TASKS_DISCARDED, TASKS_FAILED, TASKS_REQUEUED,
    TASK_DURATION,
};
use crate::runtime::agent_pool::{AgentPoolManager, Assignment};
use crate::runtime::task_queue::{QueuedTask, TaskQueue};
use crate::storage::Store;
use crate::utils::config::WorkerConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Attempts at committing a finished task before giving up
const COMMIT_ATTEMPTS: u32 = 3;

/// A task currently held by a worker
#[derive(Debug, Clone)]
pub struct InFlight {
    pub task_id: TaskId,
    pub domain: String,
    pub worker_id: usize,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

/// Serializable view of an [`InFlight`] entry
#[derive(Debug, Clone, Serialize)]
pub struct InFlightView {
    pub task_id: TaskId,
    pub domain: String,
    pub worker_id: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
}

impl From<&InFlight> for InFlightView {
    fn from(entry: &InFlight) -> Self {
        Self {
            task_id: entry.task_id,
            domain: entry.domain.clone(),
            worker_id: entry.worker_id,
            started_at: entry.started_at,
            elapsed_secs: entry.started.elapsed().as_secs_f64(),
        }
    }
}

/// What a worker did with one dequeued entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    /// Cancelled while the handler ran; the result was dropped
    Discarded,
    Requeued,
    /// Task missing or no longer pending
    Skipped,
    /// Outcome could not be stored yet; the commit is replayed on the
    /// next autoscale tick and the agent stays bound until then
    Unrecorded,
}

/// Shared state every worker reads from
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<TaskQueue>,
    pub pools: Arc<AgentPoolManager>,
    pub handler: Arc<dyn DomainHandler>,
    pub in_flight: Arc<DashMap<TaskId, InFlight>>,
    pub config: WorkerConfig,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    queue: Arc<TaskQueue>,
}

impl WorkerPool {
    /// Spawn `ctx.config.count` workers
    pub fn start(ctx: Arc<WorkerContext>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(ctx.config.count);

        for worker_id in 0..ctx.config.count {
            let ctx = Arc::clone(&ctx);
            let running = Arc::clone(&running);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, &ctx, &running))
                .map_err(|e| {
                    EngineError::InvalidState(format!("failed to spawn worker {}: {}", worker_id, e))
                })?;
            handles.push(handle);
        }

        info!("Started {} workers", handles.len());
        Ok(Self {
            handles,
            running,
            queue: Arc::clone(&ctx.queue),
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop taking work and wait for every worker to finish its current task
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.queue.close();

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
        }
    }
}

fn worker_loop(worker_id: usize, ctx: &WorkerContext, running: &AtomicBool) {
    debug!(worker = worker_id, "Worker started");

    while running.load(Ordering::Acquire) {
        let Some(entry) = ctx.queue.pop_timeout(ctx.config.poll_timeout()) else {
            if ctx.queue.is_closed() {
                break;
            }
            continue;
        };
        gauge!(QUEUE_DEPTH).set(ctx.queue.len() as f64);

        let outcome = process_entry(worker_id, ctx, entry);
        debug!(worker = worker_id, ?outcome, "Entry processed");
    }

    debug!(worker = worker_id, "Worker stopped");
}

fn requeue(ctx: &WorkerContext, entry: QueuedTask) -> Outcome {
    counter!(TASKS_REQUEUED, "domain" => entry.domain.clone()).increment(1);
    ctx.queue.requeue(entry);
    thread::sleep(ctx.config.requeue_backoff());
    Outcome::Requeued
}

/// Run one dequeued entry to completion
pub fn process_entry(worker_id: usize, ctx: &WorkerContext, entry: QueuedTask) -> Outcome {
    let task = match ctx.store.get_task(entry.task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!(task_id = %entry.task_id, "Queued task missing from store");
            return Outcome::Skipped;
        }
        Err(e) => {
            counter!(STORE_ERRORS).increment(1);
            error!(task_id = %entry.task_id, "Failed to load task: {}", e);
            return requeue(ctx, entry);
        }
    };

    if task.status != TaskStatus::Pending {
        debug!(task_id = %task.id, status = %task.status, "Skipping task that is no longer pending");
        return Outcome::Skipped;
    }

    let running = match ctx.pools.assign(&task) {
        Ok(Assignment::Assigned { task, agent, .. }) => {
            debug!(task_id = %task.id, worker = worker_id, agent = %agent.name, "Task assigned");
            task
        }
        Ok(Assignment::NoCapacity) => {
            debug!(task_id = %task.id, domain = %task.domain, "No agent available, requeueing");
            return requeue(ctx, entry);
        }
        Ok(Assignment::Stale) => return Outcome::Skipped,
        Err(e) => {
            counter!(STORE_ERRORS).increment(1);
            error!(task_id = %task.id, "Agent assignment failed: {}", e);
            return requeue(ctx, entry);
        }
    };

    run_task(worker_id, ctx, running)
}

fn run_task(worker_id: usize, ctx: &WorkerContext, running: Task) -> Outcome {
    let started = Instant::now();
    ctx.in_flight.insert(
        running.id,
        InFlight {
            task_id: running.id,
            domain: running.domain.clone(),
            worker_id,
            started,
            started_at: running.started_at.unwrap_or_else(Utc::now),
        },
    );

    let result = invoke_guarded(ctx.handler.as_ref(), &running.domain, &running.payload);
    ctx.in_flight.remove(&running.id);

    let elapsed = started.elapsed();
    histogram!(TASK_DURATION, "domain" => running.domain.clone()).record(elapsed.as_secs_f64());

    let (next, success) = match &result {
        Ok(text) => (running.complete(text.clone()), true),
        Err(e) => {
            warn!(task_id = %running.id, domain = %running.domain, "Handler failed: {}", e);
            (running.fail(e.to_string()), false)
        }
    };
    let next = match next {
        Ok(next) => next,
        Err(e) => {
            error!(task_id = %running.id, "Cannot finish task: {}", e);
            return Outcome::Unrecorded;
        }
    };

    match commit_with_retry(ctx, &next, success) {
        Ok(true) if success => {
            counter!(TASKS_COMPLETED, "domain" => next.domain.clone()).increment(1);
            info!(task_id = %next.id, worker = worker_id, "Task completed in {:?}", elapsed);
            Outcome::Completed
        }
        Ok(true) => {
            counter!(TASKS_FAILED, "domain" => next.domain.clone()).increment(1);
            Outcome::Failed
        }
        Ok(false) => {
            counter!(TASKS_DISCARDED, "domain" => next.domain.clone()).increment(1);
            info!(task_id = %next.id, "Task was cancelled while running; discarding result");
            Outcome::Discarded
        }
        Err(e) => {
            counter!(STORE_ERRORS).increment(1);
            error!(task_id = %next.id, "Failed to record task outcome: {}", e);
            ctx.pools.defer_commit(next, TaskStatus::Processing, Some(success));
            Outcome::Unrecorded
        }
    }
}

fn commit_with_retry(ctx: &WorkerContext, next: &Task, success: bool) -> Result<bool> {
    let mut attempt = 1;
    loop {
        match ctx.pools.commit_transition(next, TaskStatus::Processing, Some(success)) {
            Err(e) if e.is_retryable() && attempt < COMMIT_ATTEMPTS => {
                warn!(task_id = %next.id, attempt, "Commit failed, retrying: {}", e);
                thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                attempt += 1;
            }
            other => return other,
        }
    }
}
