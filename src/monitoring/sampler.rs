// src/monitoring/sampler.rs
//! Host resource sampling
//!
//! The health monitor only sees [`SystemSample`] values, so tests and
//! hosts where sampling is disabled can swap in a [`StaticSampler`].

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::trace;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One reading of host resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub memory_available_mb: f64,
    pub disk_usage: f64,
}

/// Source of host resource readings
pub trait SystemSampler: Send {
    fn sample(&mut self) -> SystemSample;
}

/// Samples the current host through `sysinfo`
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (used / total * 100.0).clamp(0.0, 100.0)
    }
}

impl SystemSampler for SysinfoSampler {
    fn sample(&mut self) -> SystemSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory() as f64;
        let used_memory = self.system.used_memory() as f64;

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks.list().iter().fold((0u64, 0u64), |acc, disk| {
            (acc.0 + disk.total_space(), acc.1 + disk.available_space())
        });

        let sample = SystemSample {
            cpu_usage: (self.system.global_cpu_usage() as f64).clamp(0.0, 100.0),
            memory_usage: percent(used_memory, total_memory),
            memory_available_mb: self.system.available_memory() as f64 / BYTES_PER_MB,
            disk_usage: percent(
                disk_total.saturating_sub(disk_available) as f64,
                disk_total as f64,
            ),
        };

        trace!(
            cpu = sample.cpu_usage,
            memory = sample.memory_usage,
            disk = sample.disk_usage,
            "Sampled host resources"
        );
        sample
    }
}

/// Returns a fixed reading
#[derive(Debug, Clone, Default)]
pub struct StaticSampler {
    pub sample: SystemSample,
}

impl StaticSampler {
    pub fn new(sample: SystemSample) -> Self {
        Self { sample }
    }
}

impl SystemSampler for StaticSampler {
    fn sample(&mut self) -> SystemSample {
        self.sample.clone()
    }
}
