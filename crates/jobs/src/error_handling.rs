//! Failure classification and retry decisions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use riskwatch_core::{ErrorKind, HandlerError, Severity};
use riskwatch_observability::PerformanceMonitor;

use crate::types::{JobError, JobType, RetryPolicy};

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub severity: Severity,
}

impl FailureClassification {
    pub fn of(kind: ErrorKind) -> Self {
        let (retryable, severity) = match kind {
            ErrorKind::Transient => (true, Severity::Low),
            ErrorKind::ResourceExhausted => (true, Severity::High),
            ErrorKind::Permanent => (false, Severity::High),
            ErrorKind::Validation => (false, Severity::Medium),
        };
        Self {
            kind,
            retryable,
            severity,
        }
    }
}

/// Outcome of [`ErrorHandlingService::decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Requeue after `delay`.
    Retry {
        delay: Duration,
        error: JobError,
    },
    /// Finalize the job as failed.
    Fail {
        error: JobError,
        /// True when the attempt budget ran out, false for non-retryable kinds.
        exhausted: bool,
    },
}

impl RetryDecision {
    pub fn error(&self) -> &JobError {
        match self {
            RetryDecision::Retry { error, .. } | RetryDecision::Fail { error, .. } => error,
        }
    }
}

/// Error counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub by_job_type: BTreeMap<String, u64>,
    pub retries_scheduled: u64,
    pub terminal_failures: u64,
}

/// Classifies handler failures and decides between retry and terminal failure.
#[derive(Debug, Default)]
pub struct ErrorHandlingService {
    stats: Mutex<ErrorStatistics>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl ErrorHandlingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also report every failure to `monitor` under `job.<type>`.
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn stats(&self) -> MutexGuard<'_, ErrorStatistics> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn classify(&self, error: &HandlerError) -> FailureClassification {
        FailureClassification::of(error.kind)
    }

    /// Decide what happens after attempt number `attempts` failed with `error`.
    pub fn decide(
        &self,
        job_type: &JobType,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
        error: &HandlerError,
    ) -> RetryDecision {
        let classification = self.classify(error);
        let job_error = JobError {
            kind: classification.kind,
            severity: classification.severity,
            message: error.message.clone(),
        };

        if let Some(monitor) = &self.monitor {
            monitor.record_error(&format!("job.{job_type}"), error);
        }

        let budget = RetryPolicy {
            max_retries,
            ..policy.clone()
        };
        let retry = classification.retryable && budget.should_retry(attempts);

        let mut stats = self.stats();
        stats.total += 1;
        *stats.by_kind.entry(classification.kind.to_string()).or_default() += 1;
        *stats.by_job_type.entry(job_type.to_string()).or_default() += 1;

        if retry {
            stats.retries_scheduled += 1;
            let delay = budget.delay_for_attempt(attempts);
            info!(
                job_type = %job_type,
                attempts,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = %classification.kind,
                "scheduling job retry"
            );
            RetryDecision::Retry {
                delay,
                error: job_error,
            }
        } else {
            stats.terminal_failures += 1;
            let exhausted = classification.retryable;
            warn!(
                job_type = %job_type,
                attempts,
                max_retries,
                kind = %classification.kind,
                exhausted,
                error = %error.message,
                "job failed permanently"
            );
            RetryDecision::Fail {
                error: job_error,
                exhausted,
            }
        }
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        self.stats().clone()
    }

    pub fn reset(&self) {
        *self.stats() = ErrorStatistics::default();
    }
}
