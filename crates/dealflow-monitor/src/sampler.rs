use std::sync::{Arc, RwLock};

use dealflow_models::health::SystemMetrics;
use sysinfo::{Pid, System};

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Source of host resource readings. Mockable for testing.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> SystemMetrics;
}

/// Samples the host through sysinfo.
///
/// CPU usage is computed between consecutive refreshes, so the very first
/// reading is usually zero.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> SystemMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_processes();

        let memory_total_mb = self.system.total_memory() as f64 / BYTES_PER_MB;
        let memory_used_mb = self.system.used_memory() as f64 / BYTES_PER_MB;
        let memory_percent = if memory_total_mb > 0.0 {
            memory_used_mb / memory_total_mb * 100.0
        } else {
            0.0
        };
        let process_memory_mb = self
            .pid
            .and_then(|pid| self.system.process(pid))
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0);

        SystemMetrics {
            cpu_percent: f64::from(self.system.global_cpu_info().cpu_usage()),
            memory_percent,
            memory_used_mb,
            memory_total_mb,
            process_count: self.system.processes().len(),
            process_memory_mb,
        }
    }
}

/// Sampler returning whatever metrics were last set. Clones share state.
#[derive(Clone, Default)]
pub struct FixedSampler {
    metrics: Arc<RwLock<SystemMetrics>>,
}

impl FixedSampler {
    pub fn new(metrics: SystemMetrics) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(metrics)),
        }
    }

    /// Shorthand for a reading with only CPU and memory percentages set.
    pub fn with_usage(cpu_percent: f64, memory_percent: f64) -> Self {
        Self::new(SystemMetrics {
            cpu_percent,
            memory_percent,
            memory_total_mb: 16_384.0,
            memory_used_mb: 16_384.0 * memory_percent / 100.0,
            process_count: 1,
            process_memory_mb: 128.0,
        })
    }

    pub fn set(&self, metrics: SystemMetrics) {
        let mut guard = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        *guard = metrics;
    }

    pub fn set_usage(&self, cpu_percent: f64, memory_percent: f64) {
        let mut guard = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        guard.cpu_percent = cpu_percent;
        guard.memory_percent = memory_percent;
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&mut self) -> SystemMetrics {
        self.metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
