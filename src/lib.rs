// src/lib.rs
//! Taskflow Engine Library
//!
//! Task distribution and capacity control for domain agent pools: a
//! priority queue feeding a fixed worker set, per-domain pools of agent
//! slots with bounded autoscaling, and a health monitor that scores the
//! whole system.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **engine**: Engine context object and the caller-facing operations
//! - **runtime**: Task queue, worker pool, agent pools, control loop
//! - **storage**: Persistence seam with in-memory and SQLite backends
//! - **monitoring**: Health scoring, alerts and host sampling
//! - **handler**: Domain handler trait invoked for each task
//! - **model**: Task, agent, pool, metric and alert records
//! - **observability**: Tracing and Prometheus metrics
//! - **utils**: Configuration and errors

// Public module exports
pub mod engine;
pub mod handler;
pub mod model;
pub mod monitoring;
pub mod observability;
pub mod runtime;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use engine::{Engine, PerformanceMetrics, PoolStatus, QueueStatus};
pub use handler::{DomainHandler, EchoHandler, HandlerError, HandlerErrorKind};
pub use model::{Agent, AgentId, AgentStatus, Pool, PoolHealth, Task, TaskId, TaskStatus};
pub use monitoring::{HealthReport, HealthStatus};
pub use runtime::agent_pool::ScaleDirection;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
