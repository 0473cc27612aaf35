// src/monitoring/thresholds.rs
//! Alert thresholds
//!
//! Boundaries the health monitor compares samples against:
//! - Host CPU, memory and disk usage (percent)
//! - Pool failure rate and utilization (percent)
//! - Store response time (seconds)
//! - Pending task backlog (count)

use serde::{Deserialize, Serialize};

/// Thresholds above which the monitor raises alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Warning when host CPU usage exceeds this percentage
    pub cpu_usage: f64,

    /// Critical when host memory usage exceeds this percentage
    pub memory_usage: f64,

    /// Critical when disk usage exceeds this percentage
    pub disk_usage: f64,

    /// A pool is critical when more than this percentage of its agents failed
    pub agent_failure_rate: f64,

    /// Store round trips slower than this are reported as slow
    pub slow_response_secs: f64,

    /// Warning when more tasks than this are pending
    pub queue_size_warning: usize,

    /// A pool is overloaded above this utilization percentage
    pub overloaded_utilization: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 80.0,
            memory_usage: 85.0,
            disk_usage: 90.0,
            agent_failure_rate: 10.0,
            slow_response_secs: 1.0,
            queue_size_warning: 50,
            overloaded_utilization: 90.0,
        }
    }
}

fn check_percent(name: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("{} threshold must be a positive percentage", name));
    }
    if value > 100.0 {
        return Err(format!("{} threshold cannot exceed 100%", name));
    }
    Ok(())
}

impl AlertThresholds {
    /// Validate thresholds
    pub fn validate(&self) -> Result<(), String> {
        check_percent("CPU usage", self.cpu_usage)?;
        check_percent("Memory usage", self.memory_usage)?;
        check_percent("Disk usage", self.disk_usage)?;
        check_percent("Agent failure rate", self.agent_failure_rate)?;
        check_percent("Pool utilization", self.overloaded_utilization)?;

        if !self.slow_response_secs.is_finite() || self.slow_response_secs <= 0.0 {
            return Err("Slow response threshold must be positive".to_string());
        }
        if self.slow_response_secs > 60.0 {
            return Err("Slow response threshold cannot exceed 60 seconds".to_string());
        }

        if self.queue_size_warning == 0 {
            return Err("Queue size warning cannot be 0".to_string());
        }

        Ok(())
    }
}
