//! Service wiring and lifecycle.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use riskwatch_alerts::{AlertEvent, AlertMonitor, AlertService, ResourceSampler};
use riskwatch_core::{EngineResult, StreamId};
use riskwatch_events::{EventBus, InMemoryEventBus, Subscription};
use riskwatch_jobs::{BatchProcessor, ErrorHandlingService, JobQueue, JobStatusChanged, JobStatusService};
use riskwatch_observability::PerformanceMonitor;
use riskwatch_streams::{StreamProcessor, StreamState};

use crate::config::EngineConfig;

/// What [`Engine::cleanup`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Finished jobs evicted from the queue, with their status history.
    pub jobs: usize,
    /// Resolved alerts dropped.
    pub alerts: usize,
}

struct Background {
    alerts: AlertMonitor,
    sampler: Option<ResourceSampler>,
}

/// A running engine: every service built from one [`EngineConfig`], sharing
/// one performance monitor and one job status event bus.
pub struct Engine {
    config: EngineConfig,
    monitor: Arc<PerformanceMonitor>,
    status_events: Arc<InMemoryEventBus<JobStatusChanged>>,
    alert_events: Arc<InMemoryEventBus<AlertEvent>>,
    status: Arc<JobStatusService>,
    errors: Arc<ErrorHandlingService>,
    queue: JobQueue,
    batches: Arc<BatchProcessor>,
    streams: Arc<StreamProcessor>,
    alerts: Arc<AlertService>,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("queue", &self.queue)
            .field("streams", &self.streams)
            .field("alerts", &self.alerts)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build all services, start the queue dispatcher and the background
    /// alert feeds. Must be called within a Tokio runtime.
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let status_events: Arc<InMemoryEventBus<JobStatusChanged>> =
            Arc::new(InMemoryEventBus::with_capacity(config.event_bus_capacity));
        let alert_events: Arc<InMemoryEventBus<AlertEvent>> =
            Arc::new(InMemoryEventBus::with_capacity(config.event_bus_capacity));

        let status = Arc::new(JobStatusService::in_memory().with_event_bus(status_events.clone()));
        let errors = Arc::new(ErrorHandlingService::new().with_monitor(monitor.clone()));
        let queue = JobQueue::new(config.queue.clone(), status.clone(), errors.clone(), monitor.clone())?;
        let batches = Arc::new(BatchProcessor::new(config.batch.clone(), monitor.clone()));
        let streams = Arc::new(StreamProcessor::new(monitor.clone()));
        let alerts = Arc::new(AlertService::new(config.alerts.clone()).with_event_bus(alert_events.clone()));

        // Subscribe before the queue runs so no status change is missed.
        let alert_monitor = AlertMonitor::spawn(alerts.clone(), status_events.subscribe());
        let sampler = config
            .resource_sample_interval
            .map(|interval| ResourceSampler::spawn(alerts.clone(), monitor.clone(), interval));
        queue.start();

        info!(
            concurrency = config.queue.concurrency,
            capacity = config.queue.capacity,
            max_retries = config.queue.retry_policy.max_retries,
            resource_sampling = sampler.is_some(),
            "engine started"
        );

        Ok(Self {
            config,
            monitor,
            status_events,
            alert_events,
            status,
            errors,
            queue,
            batches,
            streams,
            alerts,
            background: Mutex::new(Some(Background {
                alerts: alert_monitor,
                sampler,
            })),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn status(&self) -> &Arc<JobStatusService> {
        &self.status
    }

    pub fn errors(&self) -> &Arc<ErrorHandlingService> {
        &self.errors
    }

    pub fn batches(&self) -> &Arc<BatchProcessor> {
        &self.batches
    }

    pub fn streams(&self) -> &Arc<StreamProcessor> {
        &self.streams
    }

    pub fn alerts(&self) -> &Arc<AlertService> {
        &self.alerts
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn subscribe_status_changes(&self) -> Subscription<JobStatusChanged> {
        self.status_events.subscribe()
    }

    pub fn subscribe_alerts(&self) -> Subscription<AlertEvent> {
        self.alert_events.subscribe()
    }

    /// Create a stream with the engine's default stream configuration.
    pub fn create_stream(&self, id: StreamId) -> EngineResult<StreamState> {
        self.streams.create_stream_processor(id, self.config.stream.clone())
    }

    /// Forget finished jobs and resolved alerts older than `older_than`.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> EngineResult<CleanupReport> {
        let report = CleanupReport {
            jobs: self.queue.cleanup_finished(older_than)?,
            alerts: self.alerts.cleanup_resolved(older_than),
        };
        info!(jobs = report.jobs, alerts = report.alerts, cutoff = %older_than, "engine cleanup");
        Ok(report)
    }

    /// Stop the queue (in-flight attempts settle), stop every stream with a
    /// final flush, then stop the alert feeds and close both buses.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(background) = background else {
            return;
        };

        self.queue.shutdown().await;
        self.streams.shutdown().await;

        let handled = background.alerts.stop().await;
        if let Some(sampler) = background.sampler {
            sampler.stop().await;
        }
        self.status_events.close();
        self.alert_events.close();

        let alerts = self.alerts.get_alert_statistics();
        if alerts.active > 0 {
            warn!(active_alerts = alerts.active, "engine stopping with active alerts");
        }
        info!(status_events = handled, queue = ?self.queue.stats(), "engine stopped");
    }
}
