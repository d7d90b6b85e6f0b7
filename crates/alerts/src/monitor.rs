//! Background feeds into the alert service.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use riskwatch_events::Subscription;
use riskwatch_jobs::{JobStatus, JobStatusChanged};
use riskwatch_observability::PerformanceMonitor;

use crate::service::AlertService;

/// Watches job status changes and reports failures and completions.
#[derive(Debug)]
pub struct AlertMonitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl AlertMonitor {
    /// Spawn the monitor task. Must be called within a Tokio runtime.
    pub fn spawn(service: Arc<AlertService>, mut events: Subscription<JobStatusChanged>) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut handled = 0u64;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                handled += 1;
                apply(&service, &event);
            }
            // Drain what is already queued so a stop right after a failure still alerts.
            while let Some(event) = events.try_recv() {
                handled += 1;
                apply(&service, &event);
            }
            debug!(handled, "alert monitor exiting");
            handled
        });
        info!("alert monitor started");
        Self { shutdown, handle }
    }

    /// Stop the task; returns how many events it handled.
    pub async fn stop(self) -> u64 {
        self.shutdown.send_replace(true);
        match self.handle.await {
            Ok(handled) => handled,
            Err(e) => {
                warn!(error = %e, "alert monitor task failed");
                0
            }
        }
    }
}

fn apply(service: &AlertService, event: &JobStatusChanged) {
    match event.to {
        JobStatus::Failed => {
            service.record_job_failure(&event.job_type, event.job_id, event.error.as_ref());
        }
        JobStatus::Completed => {
            service.record_job_success(&event.job_type);
        }
        _ => {}
    }
}

/// Periodically samples host resources into the alert service.
#[derive(Debug)]
pub struct ResourceSampler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ResourceSampler {
    /// Spawn the sampler. Must be called within a Tokio runtime.
    pub fn spawn(service: Arc<AlertService>, monitor: Arc<PerformanceMonitor>, interval: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }

                let monitor = monitor.clone();
                let metrics = match tokio::task::spawn_blocking(move || monitor.get_system_metrics()).await {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        warn!(error = %e, "resource sampling failed");
                        continue;
                    }
                };
                debug!(metrics = %metrics.to_log_string(), "resource sample");
                service.record_resource_sample(&metrics);
            }
        });
        info!(interval_secs = interval.as_secs(), "resource sampler started");
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "resource sampler task failed");
        }
    }
}
