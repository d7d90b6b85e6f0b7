//! Concurrency-bounded job queue with retry and backoff.
//!
//! Jobs are admitted in FIFO order into a bounded pending queue. A single
//! dispatcher task waits for a free worker slot (a semaphore permit), pops the
//! front of the queue and spawns the attempt. Failed attempts are classified by
//! [`ErrorHandlingService`]; retryable ones go back to the tail of the queue
//! after their backoff delay.
//!
//! The queue's view of a job (the [`Job`] in its store) and the status record
//! in [`JobStatusService`] are always updated together under one lock, which is
//! also what makes cancellation race-free against completion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use riskwatch_core::{EngineError, EngineResult, HandlerError, JobId};
use riskwatch_observability::PerformanceMonitor;

use crate::error_handling::{ErrorHandlingService, RetryDecision};
use crate::registry::{HandlerRegistry, JobContext, JobHandler};
use crate::status::{JobStatusRecord, JobStatusService};
use crate::store::{InMemoryStore, RecordStore};
use crate::types::{Job, JobSnapshot, JobStatus, JobType, RetryPolicy, SubmitOptions};

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrently running jobs
    pub concurrency: usize,
    /// Maximum queued (not yet dispatched) jobs before submissions are rejected
    pub capacity: usize,
    /// Default retry policy; `SubmitOptions::max_retries` overrides the budget
    pub retry_policy: RetryPolicy,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            name: "job-queue".to_string(),
            concurrency: 4,
            capacity: 1000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl JobQueueConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.concurrency == 0 {
            return Err(EngineError::validation("queue concurrency must be at least 1"));
        }
        if self.capacity == 0 {
            return Err(EngineError::validation("queue capacity must be at least 1"));
        }
        if self.retry_policy.max_retries == 0 {
            return Err(EngineError::validation("max_retries must be at least 1"));
        }
        Ok(())
    }
}

/// Queue runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting for a worker.
    pub queued: usize,
    pub in_flight: usize,
    /// Jobs sleeping through a retry backoff.
    pub delayed: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Everything a worker needs for one attempt.
struct Attempt {
    job_id: JobId,
    job_type: JobType,
    payload: serde_json::Value,
    attempt: u32,
    started_at: DateTime<Utc>,
    handler: Arc<dyn JobHandler>,
}

struct QueueInner {
    config: JobQueueConfig,
    registry: HandlerRegistry,
    jobs: Arc<dyn RecordStore<JobId, Job>>,
    status: Arc<JobStatusService>,
    errors: Arc<ErrorHandlingService>,
    monitor: Arc<PerformanceMonitor>,
    pending: Mutex<VecDeque<JobId>>,
    transitions: Mutex<()>,
    notify: Notify,
    slots: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    delayed: AtomicUsize,
    counters: Counters,
    started_at: Instant,
}

/// Bounded worker pool fed by a FIFO queue.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobQueue {
    pub fn new(
        config: JobQueueConfig,
        status: Arc<JobStatusService>,
        errors: Arc<ErrorHandlingService>,
        monitor: Arc<PerformanceMonitor>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(config.concurrency));
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                registry: HandlerRegistry::new(),
                jobs: InMemoryStore::arc(),
                status,
                errors,
                monitor,
                pending: Mutex::new(VecDeque::new()),
                transitions: Mutex::new(()),
                notify: Notify::new(),
                slots,
                shutdown,
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                delayed: AtomicUsize::new(0),
                counters: Counters::default(),
                started_at: Instant::now(),
            }),
            dispatcher: Arc::new(Mutex::new(None)),
        })
    }

    /// Queue with its own in-memory status service and monitor.
    pub fn in_memory(config: JobQueueConfig) -> EngineResult<Self> {
        Self::new(
            config,
            Arc::new(JobStatusService::in_memory()),
            Arc::new(ErrorHandlingService::new()),
            Arc::new(PerformanceMonitor::default()),
        )
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.inner.config
    }

    pub fn status_service(&self) -> &Arc<JobStatusService> {
        &self.inner.status
    }

    /// Register the handler for `job_type`.
    pub fn register<H>(&self, job_type: &str, handler: H) -> EngineResult<()>
    where
        H: JobHandler + 'static,
    {
        self.inner
            .registry
            .register(JobType::new(job_type)?, Arc::new(handler))
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.inner.registry.job_types()
    }

    /// Submit a job with the queue defaults.
    pub fn submit(&self, job_type: &str, payload: serde_json::Value) -> EngineResult<JobId> {
        self.submit_with(job_type, payload, SubmitOptions::default())
    }

    /// Submit a job with per-job overrides.
    pub fn submit_with(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> EngineResult<JobId> {
        let inner = &self.inner;
        let job_type = JobType::new(job_type)?;
        if !inner.registry.contains(&job_type) {
            return Err(EngineError::validation(format!(
                "no handler registered for job type {job_type}"
            )));
        }
        if inner.closed.load(Ordering::Acquire) {
            bump(&inner.counters.rejected);
            return Err(EngineError::backpressure(format!(
                "queue {} is shut down",
                inner.config.name
            )));
        }

        let max_retries = options
            .max_retries
            .unwrap_or(inner.config.retry_policy.max_retries)
            .max(1);
        let job = Job::new(job_type, payload, max_retries).with_priority(options.priority);
        let job_id = job.id;

        {
            let mut pending = lock(&inner.pending);
            if pending.len() >= inner.config.capacity {
                bump(&inner.counters.rejected);
                warn!(
                    queue = %inner.config.name,
                    job_type = %job.job_type,
                    capacity = inner.config.capacity,
                    "job rejected: queue full"
                );
                return Err(EngineError::backpressure(format!(
                    "queue {} is full ({} jobs waiting)",
                    inner.config.name, inner.config.capacity
                )));
            }
            // The status record must exist before a worker can see the job.
            inner
                .status
                .create(job_id, job.job_type.clone(), job.priority.clone())?;
            inner.jobs.insert_new(job_id, job.clone())?;
            pending.push_back(job_id);
        }

        bump(&inner.counters.submitted);
        inner.notify.notify_one();
        info!(job_id = %job_id, job_type = %job.job_type, max_retries, "job submitted");
        Ok(job_id)
    }

    /// Immutable snapshot of a job, including terminal ones.
    pub fn get_job_status(&self, job_id: JobId) -> EngineResult<JobSnapshot> {
        let job = self
            .inner
            .jobs
            .get(&job_id)?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        let progress = match self.inner.status.get(job_id) {
            Ok(record) => record.progress,
            Err(_) if job.status == JobStatus::Completed => 100.0,
            Err(_) => 0.0,
        };
        Ok(JobSnapshot::from_job(&job, progress))
    }

    /// Cancel a pending or running job.
    ///
    /// A pending job leaves the queue. A running job keeps running; its result
    /// is discarded when it finishes.
    pub fn cancel(&self, job_id: JobId, reason: Option<String>) -> EngineResult<JobStatusRecord> {
        let inner = &self.inner;
        let _guard = lock(&inner.transitions);
        let mut job = inner
            .jobs
            .get(&job_id)?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;

        let record = inner.status.cancel(job_id, reason)?;
        let was_pending = job.status == JobStatus::Pending;
        job.mark_cancelled();
        inner.jobs.upsert(job_id, job)?;
        if was_pending {
            lock(&inner.pending).retain(|id| *id != job_id);
        }
        bump(&inner.counters.cancelled);
        Ok(record)
    }

    /// Evict terminal jobs last updated before `older_than`, together with
    /// their archived status records. Returns how many jobs were evicted.
    pub fn cleanup_finished(&self, older_than: DateTime<Utc>) -> EngineResult<usize> {
        let inner = &self.inner;
        let evicted = {
            let _guard = lock(&inner.transitions);
            let expired = inner
                .jobs
                .query(&|job| job.status.is_terminal() && job.updated_at < older_than)?;
            for job in &expired {
                inner.jobs.delete(&job.id)?;
            }
            expired.len()
        };
        let archived = inner.status.cleanup_history(older_than)?;
        if evicted > 0 {
            info!(
                queue = %inner.config.name,
                evicted,
                archived,
                cutoff = %older_than,
                "finished jobs cleaned up"
            );
        }
        Ok(evicted)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = &self.inner;
        let c = &inner.counters;
        QueueStats {
            queued: lock(&inner.pending).len(),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            delayed: inner.delayed.load(Ordering::Relaxed),
            submitted: c.submitted.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            uptime_secs: inner.started_at.elapsed().as_secs(),
        }
    }

    /// Spawn the dispatcher. Must be called within a Tokio runtime; calling it
    /// again while running is a no-op.
    pub fn start(&self) {
        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_some() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        info!(
            queue = %self.inner.config.name,
            concurrency = self.inner.config.concurrency,
            capacity = self.inner.config.capacity,
            "job queue started"
        );
        let inner = self.inner.clone();
        *dispatcher = Some(tokio::spawn(dispatch_loop(inner)));
    }

    /// Stop dispatching and wait for in-flight attempts to settle.
    ///
    /// Jobs still queued or waiting out a backoff stay `pending`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        inner.shutdown.send_replace(true);

        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(queue = %inner.config.name, error = %e, "job dispatcher panicked");
            }
        }

        let all = inner.config.concurrency as u32;
        if let Ok(permits) = inner.slots.acquire_many(all).await {
            drop(permits);
        }
        info!(queue = %inner.config.name, stats = ?self.stats(), "job queue stopped");
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = loop {
            if let Some(job_id) = lock(&inner.pending).pop_front() {
                break Some(job_id);
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break None,
                _ = inner.notify.notified() => {}
            }
        };
        let Some(job_id) = next else { break };

        inner.clone().launch(job_id, permit);
    }

    debug!(queue = %inner.config.name, "job dispatcher exiting");
}

impl QueueInner {
    fn launch(self: Arc<Self>, job_id: JobId, permit: OwnedSemaphorePermit) {
        let attempt = match self.begin_attempt(job_id) {
            Ok(Some(attempt)) => attempt,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to start job attempt");
                return;
            }
        };

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            self.run_attempt(attempt).await;
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    /// `pending → running`. Returns `None` if the job was cancelled meanwhile.
    fn begin_attempt(&self, job_id: JobId) -> EngineResult<Option<Attempt>> {
        let _guard = lock(&self.transitions);
        let Some(mut job) = self.jobs.get(&job_id)? else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            debug!(job_id = %job_id, status = %job.status, "skipping job that is no longer pending");
            return Ok(None);
        }
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Err(EngineError::validation(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };

        self.status.mark_running(job_id)?;
        job.mark_running();
        self.jobs.upsert(job_id, job.clone())?;
        debug!(job_id = %job_id, job_type = %job.job_type, attempt = job.attempts, "job attempt started");

        Ok(Some(Attempt {
            job_id,
            job_type: job.job_type,
            payload: job.payload,
            attempt: job.attempts,
            started_at: job.updated_at,
            handler,
        }))
    }

    async fn run_attempt(self: &Arc<Self>, attempt: Attempt) {
        let operation = format!("job.{}", attempt.job_type);
        let ctx = JobContext::new(
            attempt.job_id,
            attempt.job_type.clone(),
            attempt.payload,
            attempt.attempt,
            self.status.clone(),
        );

        let token = self.monitor.start_timing(&operation);
        let handler = attempt.handler;
        // A panicking handler fails its attempt instead of killing the worker.
        let outcome = match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(HandlerError::permanent(format!("handler panicked: {e}"))),
        };
        self.monitor.end_timing(&operation, token, outcome.is_ok());

        let settled = match outcome {
            Ok(result) => self.settle_success(attempt.job_id, result, attempt.started_at),
            Err(err) => self.settle_failure(attempt.job_id, err, attempt.started_at),
        };
        if let Err(e) = settled {
            error!(job_id = %attempt.job_id, error = %e, "failed to record job outcome");
        }
    }

    fn settle_success(
        &self,
        job_id: JobId,
        result: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let _guard = lock(&self.transitions);
        // Only a cancelled job can be evicted while its attempt is running.
        let Some(mut job) = self.jobs.get(&job_id)? else {
            info!(job_id = %job_id, "discarding result of evicted job");
            return Ok(());
        };
        if job.status == JobStatus::Cancelled {
            info!(job_id = %job_id, "discarding result of cancelled job");
            return Ok(());
        }

        job.mark_completed(result, started_at);
        self.jobs.upsert(job_id, job.clone())?;
        self.status.complete(job_id)?;
        bump(&self.counters.succeeded);
        info!(job_id = %job_id, job_type = %job.job_type, attempts = job.attempts, "job completed");
        Ok(())
    }

    fn settle_failure(
        self: &Arc<Self>,
        job_id: JobId,
        err: HandlerError,
        started_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let _guard = lock(&self.transitions);
        let Some(mut job) = self.jobs.get(&job_id)? else {
            info!(job_id = %job_id, error = %err, "discarding failure of evicted job");
            return Ok(());
        };
        if job.status == JobStatus::Cancelled {
            info!(job_id = %job_id, error = %err, "discarding failure of cancelled job");
            return Ok(());
        }

        let decision = self.errors.decide(
            &job.job_type,
            job.attempts,
            job.max_retries,
            &self.config.retry_policy,
            &err,
        );
        match decision {
            RetryDecision::Retry { delay, error } => {
                job.mark_retrying(error.clone(), started_at);
                self.jobs.upsert(job_id, job)?;
                self.status.mark_retrying(job_id, error)?;
                bump(&self.counters.retried);
                self.schedule_retry(job_id, delay);
            }
            RetryDecision::Fail { error, .. } => {
                job.mark_failed(error.clone(), started_at);
                self.jobs.upsert(job_id, job)?;
                self.status.fail(job_id, error)?;
                bump(&self.counters.failed);
            }
        }
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, job_id: JobId, delay: Duration) {
        self.delayed.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let stopped = async {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            };
            let elapsed = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = stopped => false,
            };
            inner.delayed.fetch_sub(1, Ordering::Relaxed);
            if elapsed {
                inner.requeue(job_id);
            }
        });
    }

    fn requeue(&self, job_id: JobId) {
        let _guard = lock(&self.transitions);
        match self.jobs.get(&job_id) {
            Ok(Some(job)) if job.status == JobStatus::Pending => {
                lock(&self.pending).push_back(job_id);
                self.notify.notify_one();
                debug!(job_id = %job_id, attempts = job.attempts, "job requeued for retry");
            }
            Ok(_) => debug!(job_id = %job_id, "retry dropped: job no longer pending"),
            Err(e) => error!(job_id = %job_id, error = %e, "failed to requeue job"),
        }
    }
}
