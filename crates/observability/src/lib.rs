//! Logging, performance metrics and host resource snapshots.

pub mod logging;
pub mod metrics;
pub mod system;

pub use metrics::{MonitorConfig, OperationMetrics, PerformanceMonitor, PerformanceSample, TimingToken};
pub use system::{SystemMetrics, SystemSampler};

/// Initialize process-wide logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init();
}
