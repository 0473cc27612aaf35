// src/runtime/mod.rs
//! Task execution runtime
//!
//! This module provides the moving parts of the engine:
//!
//! - **Task Queue**: global priority queue (priority, then submission order)
//! - **Worker Pool**: fixed set of threads running the domain handler
//! - **Agent Pool**: per-domain capacity with bounded autoscaling
//! - **Control Loop**: single driver for autoscale and health ticks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Task Queue                         │
//! │          (priority 1..10, FIFO within priority)         │
//! └──────────────┬──────────────┬──────────────┬────────────┘
//!                ▼              ▼              ▼
//!           ┌─────────┐    ┌─────────┐    ┌─────────┐
//!           │worker-0 │    │worker-1 │    │worker-N │ ──► Domain Handler
//!           └────┬────┘    └────┬────┘    └────┬────┘
//!                └──── assign / release ───────┘
//!                               │
//! ┌─────────────────────────────▼───────────────────────────┐
//! │                  Agent Pool Manager                     │
//! │   healthcare │ financial │ sports │ business │ general  │
//! └─────────────────────────────▲───────────────────────────┘
//!                               │ autoscale (30s)
//!                        ┌──────┴───────┐
//!                        │ Control Loop │ ──► Health Monitor (60s)
//!                        └──────────────┘
//! ```

pub mod agent_pool;
pub mod control_loop;
pub mod task_queue;
pub mod worker_pool;

// Re-export commonly used types
pub use agent_pool::{AgentPoolManager, Assignment, ScaleDirection, ScalingDecision, ScalingEvent};
pub use control_loop::ControlLoop;
pub use task_queue::{QueueStats, QueuedTask, TaskQueue};
pub use worker_pool::{InFlight, InFlightView, Outcome, WorkerContext, WorkerPool};
