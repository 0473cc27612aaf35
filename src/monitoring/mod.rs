// src/monitoring/mod.rs
//! Health monitoring
//!
//! - **Health Monitor**: composite 0-100 score, threshold alerts, reports
//! - **Sampler**: host CPU, memory and disk readings
//! - **Thresholds**: alert boundaries with validation

pub mod health_monitor;
pub mod sampler;
pub mod thresholds;

pub use health_monitor::{
    DatabaseHealth, DatabaseStatus, HealthData, HealthMonitor, HealthReport, HealthStatus,
    PoolHealthReport,
};
pub use sampler::{StaticSampler, SysinfoSampler, SystemSample, SystemSampler};
pub use thresholds::AlertThresholds;
