//! Operation timing and aggregation.
//!
//! Every operation name owns a bounded window of recent samples. Aggregates
//! (count, success rate, percentiles) are computed on demand from that window,
//! so memory stays flat no matter how long the process runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::system::{SystemMetrics, SystemSampler};

/// Performance monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Samples retained per operation.
    pub window_size: usize,
    /// Samples slower than this are logged at `warn`.
    pub slow_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            slow_threshold: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }
}

/// Opaque handle returned by [`PerformanceMonitor::start_timing`].
#[derive(Debug)]
#[must_use = "a timing token records nothing until passed to end_timing"]
pub struct TimingToken {
    started: Instant,
}

impl TimingToken {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// One recorded execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub duration: Duration,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregates for one operation over its retained window.
///
/// Latencies are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Samples in the window.
    pub count: u64,
    /// Samples recorded since start (or the last reset).
    pub total_recorded: u64,
    /// Successful fraction of the window, in [0, 1].
    pub success_rate: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    /// Failures reported through `record_error`.
    pub errors: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct OperationWindow {
    samples: VecDeque<PerformanceSample>,
    total_recorded: u64,
    errors: u64,
    last_error: Option<String>,
}

impl OperationWindow {
    fn push(&mut self, sample: PerformanceSample, capacity: usize) {
        while self.samples.len() >= capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total_recorded += 1;
    }

    fn aggregate(&self) -> OperationMetrics {
        let mut durations: Vec<f64> = self
            .samples
            .iter()
            .map(|s| as_millis_f64(s.duration))
            .collect();
        durations.sort_by(|a, b| a.total_cmp(b));

        let count = durations.len();
        let successes = self.samples.iter().filter(|s| s.success).count();
        let (success_rate, avg) = if count == 0 {
            (0.0, 0.0)
        } else {
            (
                successes as f64 / count as f64,
                durations.iter().sum::<f64>() / count as f64,
            )
        };

        OperationMetrics {
            count: count as u64,
            total_recorded: self.total_recorded,
            success_rate,
            p50: percentile(&durations, 50.0),
            p95: percentile(&durations, 95.0),
            p99: percentile(&durations, 99.0),
            avg,
            min: durations.first().copied().unwrap_or(0.0),
            max: durations.last().copied().unwrap_or(0.0),
            errors: self.errors,
            last_error: self.last_error.clone(),
        }
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Percentile of an ascending slice using linear interpolation between the
/// two closest ranks (`rank = p/100 · (n − 1)`).
///
/// For `[10, 20, …, 100]` this yields p50 = 55 and p99 = 99.1.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Records operation timings and error counts.
///
/// Shared behind an `Arc` by every service; all methods take `&self`.
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    operations: Mutex<HashMap<String, OperationWindow>>,
    system: SystemSampler,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            operations: Mutex::new(HashMap::new()),
            system: SystemSampler::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // Metrics are best-effort: a panic while holding the lock must not take
    // the monitor down with it.
    fn operations(&self) -> MutexGuard<'_, HashMap<String, OperationWindow>> {
        self.operations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Capture a start instant for `operation`.
    pub fn start_timing(&self, operation: &str) -> TimingToken {
        debug!(operation, "timing started");
        TimingToken {
            started: Instant::now(),
        }
    }

    /// Close a timing and record it. Returns the measured duration.
    pub fn end_timing(&self, operation: &str, token: TimingToken, success: bool) -> Duration {
        let duration = token.started.elapsed();
        self.record_sample(operation, duration, success);
        duration
    }

    /// Record an externally measured duration.
    pub fn record_sample(&self, operation: &str, duration: Duration, success: bool) {
        if duration >= self.config.slow_threshold {
            warn!(operation, duration_ms = duration.as_millis() as u64, "slow operation");
        }

        let sample = PerformanceSample {
            duration,
            success,
            recorded_at: Utc::now(),
        };
        let capacity = self.config.window_size.max(1);
        self.operations()
            .entry(operation.to_string())
            .or_default()
            .push(sample, capacity);
    }

    /// Log and count a failure of `operation`.
    pub fn record_error(&self, operation: &str, error: &dyn core::fmt::Display) {
        let message = error.to_string();
        warn!(operation, error = %message, "operation failed");

        let mut ops = self.operations();
        let window = ops.entry(operation.to_string()).or_default();
        window.errors += 1;
        window.last_error = Some(message);
    }

    /// Time a fallible future, recording success from its result.
    pub async fn time<T, E, F>(&self, operation: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: core::fmt::Display,
    {
        let token = self.start_timing(operation);
        let result = fut.await;
        self.end_timing(operation, token, result.is_ok());
        if let Err(ref e) = result {
            self.record_error(operation, e);
        }
        result
    }

    pub fn get_operation_metrics(&self, operation: &str) -> Option<OperationMetrics> {
        self.operations().get(operation).map(OperationWindow::aggregate)
    }

    /// Aggregates for every operation seen so far, keyed by name.
    pub fn get_all_metrics(&self) -> BTreeMap<String, OperationMetrics> {
        self.operations()
            .iter()
            .map(|(name, window)| (name.clone(), window.aggregate()))
            .collect()
    }

    /// Host resource snapshot (CPU, memory, uptime).
    pub fn get_system_metrics(&self) -> SystemMetrics {
        self.system.sample()
    }

    /// Drop all recorded samples and counters.
    pub fn reset(&self) {
        self.operations().clear();
    }
}
