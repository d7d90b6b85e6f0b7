//! Host resource snapshots gathered from `sysinfo`.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Snapshot of CPU, memory and uptime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Global CPU usage across all cores, in percent.
    pub cpu_percent: f32,
    /// CPU usage of this process, in percent of one core.
    pub process_cpu_percent: Option<f32>,
    pub cpu_count: usize,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Resident memory of this process.
    pub process_memory_bytes: Option<u64>,
    /// Seconds since the sampler (and thus the monitor) was created.
    pub uptime_secs: u64,
    pub host_uptime_secs: u64,
    pub sampled_at: DateTime<Utc>,
}

impl SystemMetrics {
    /// Used memory as a percentage of total, 0 when the total is unknown.
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
    }

    /// Concise single-line rendering for logs.
    pub fn to_log_string(&self) -> String {
        format!(
            "uptime={}s cpu={:.1}% mem={}MB/{}MB proc_mem={}",
            self.uptime_secs,
            self.cpu_percent,
            self.memory_used_bytes / 1024 / 1024,
            self.memory_total_bytes / 1024 / 1024,
            self.process_memory_bytes
                .map(|b| format!("{}MB", b / 1024 / 1024))
                .unwrap_or_else(|| "N/A".to_string()),
        )
    }
}

/// Keeps one `System` around so CPU usage is measured between samples
/// rather than from a cold start each time.
#[derive(Debug)]
pub struct SystemSampler {
    system: Mutex<System>,
    started_at: Instant,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            started_at: Instant::now(),
        }
    }

    pub fn sample(&self) -> SystemMetrics {
        let mut sys = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sys.refresh_cpu();
        sys.refresh_memory();

        let mut process_cpu_percent = None;
        let mut process_memory_bytes = None;
        if let Ok(pid) = sysinfo::get_current_pid() {
            if sys.refresh_process(pid) {
                if let Some(process) = sys.process(pid) {
                    process_cpu_percent = Some(process.cpu_usage());
                    process_memory_bytes = Some(process.memory());
                }
            }
        }

        SystemMetrics {
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            process_cpu_percent,
            cpu_count: sys.cpus().len(),
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: sys.total_memory(),
            process_memory_bytes,
            uptime_secs: self.started_at.elapsed().as_secs(),
            host_uptime_secs: System::uptime(),
            sampled_at: Utc::now(),
        }
    }
}
