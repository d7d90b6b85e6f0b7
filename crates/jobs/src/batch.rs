//! Resumable chunked batch processing.
//!
//! A batch job walks a [`BatchSource`] in fixed-size chunks. The cursor is
//! stored on the job after every chunk, so a paused (or retried) job picks up
//! where it left off. Pause and cancel are cooperative: they are requested on
//! the job and honoured between chunks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use riskwatch_core::{BatchJobId, EngineError, EngineResult, HandlerError, catch_unwind};
use riskwatch_observability::PerformanceMonitor;

/// Batch job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// A job fails once `error_count / records_processed` exceeds this.
    pub error_rate_threshold: f64,
    /// The error rate is only checked after this many records.
    pub min_records_for_error_rate: u64,
    pub default_chunk_size: usize,
    pub default_max_retries: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.1,
            min_records_for_error_rate: 10,
            default_chunk_size: 100,
            default_max_retries: 3,
        }
    }
}

impl BatchConfig {
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    pub fn with_min_records_for_error_rate(mut self, records: u64) -> Self {
        self.min_records_for_error_rate = records;
        self
    }

    pub fn with_default_chunk_size(mut self, chunk_size: usize) -> Self {
        self.default_chunk_size = chunk_size;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

/// Parameters of a new batch job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchJobSpec {
    pub name: String,
    /// Known record count, used for progress. Falls back to the source's count.
    pub total_records: Option<u64>,
    pub chunk_size: Option<usize>,
    pub max_retries: Option<u32>,
}

impl BatchJobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_total_records(mut self, total: u64) -> Self {
        self.total_records = Some(total);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Snapshot of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: BatchJobId,
    pub name: String,
    pub status: BatchStatus,
    /// Percent complete; only advances while the total is known.
    pub progress: f64,
    pub records_processed: u64,
    pub total_records: Option<u64>,
    pub error_count: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub chunk_size: usize,
    /// Offset of the next chunk in the source.
    pub cursor: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl BatchJob {
    pub fn error_rate(&self) -> f64 {
        if self.records_processed == 0 {
            0.0
        } else {
            self.error_count as f64 / self.records_processed as f64
        }
    }

    fn finish(&mut self, status: BatchStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
        if status == BatchStatus::Completed {
            self.progress = 100.0;
        }
    }
}

/// Paged record source.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Up to `limit` records starting at `offset`; fewer (or none) at the end.
    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<serde_json::Value>, HandlerError>;

    /// Total number of records, if known up front.
    fn total(&self) -> Option<u64> {
        None
    }
}

/// In-memory source over a vector of records.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    records: Vec<serde_json::Value>,
}

impl VecSource {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl BatchSource for VecSource {
    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<serde_json::Value>, HandlerError> {
        let start = (offset as usize).min(self.records.len());
        let end = start.saturating_add(limit).min(self.records.len());
        Ok(self.records[start..end].to_vec())
    }

    fn total(&self) -> Option<u64> {
        Some(self.records.len() as u64)
    }
}

/// Per-record handler.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: serde_json::Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> RecordHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, record: serde_json::Value) -> Result<(), HandlerError> {
        (self)(record).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Pause,
    Cancel,
}

#[derive(Debug)]
struct BatchEntry {
    job: BatchJob,
    stop: Option<StopRequest>,
}

/// Runs batch jobs chunk by chunk.
#[derive(Debug)]
pub struct BatchProcessor {
    config: BatchConfig,
    jobs: Mutex<HashMap<BatchJobId, BatchEntry>>,
    monitor: Arc<PerformanceMonitor>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            monitor,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<BatchJobId, BatchEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to the stored job and return the updated snapshot.
    fn update<T>(
        &self,
        id: BatchJobId,
        f: impl FnOnce(&mut BatchEntry) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut jobs = self.jobs();
        let entry = jobs
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("batch job", id))?;
        f(entry)
    }

    pub fn create_batch_job(&self, spec: BatchJobSpec) -> EngineResult<BatchJob> {
        if spec.name.trim().is_empty() {
            return Err(EngineError::validation("batch job name must not be empty"));
        }
        let chunk_size = spec.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 {
            return Err(EngineError::validation("chunk size must be at least 1"));
        }

        let now = Utc::now();
        let job = BatchJob {
            id: BatchJobId::new(),
            name: spec.name,
            status: BatchStatus::Pending,
            progress: 0.0,
            records_processed: 0,
            total_records: spec.total_records,
            error_count: 0,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
            chunk_size,
            cursor: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            error: None,
        };
        info!(batch_id = %job.id, name = %job.name, chunk_size, "batch job created");
        self.jobs().insert(
            job.id,
            BatchEntry {
                job: job.clone(),
                stop: None,
            },
        );
        Ok(job)
    }

    pub fn get_batch_job(&self, id: BatchJobId) -> EngineResult<BatchJob> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| EngineError::not_found("batch job", id))
    }

    /// Pending jobs, oldest first.
    pub fn get_pending_batch_jobs(&self) -> Vec<BatchJob> {
        let mut pending: Vec<BatchJob> = self
            .jobs()
            .values()
            .filter(|entry| entry.job.status == BatchStatus::Pending)
            .map(|entry| entry.job.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
    }

    /// Process a pending or paused job until it completes, fails, or is
    /// paused/cancelled. Returns the job as it was left.
    pub async fn start_batch_processing<S, H>(
        &self,
        id: BatchJobId,
        source: &S,
        handler: &H,
    ) -> EngineResult<BatchJob>
    where
        S: BatchSource + ?Sized,
        H: RecordHandler + ?Sized,
    {
        let mut job = self.update(id, |entry| {
            let job = &mut entry.job;
            if !matches!(job.status, BatchStatus::Pending | BatchStatus::Paused) {
                return Err(EngineError::invalid_transition(job.status, BatchStatus::Running));
            }
            let now = Utc::now();
            job.status = BatchStatus::Running;
            job.started_at.get_or_insert(now);
            job.updated_at = now;
            if job.total_records.is_none() {
                job.total_records = source.total();
            }
            entry.stop = None;
            Ok(job.clone())
        })?;
        info!(batch_id = %id, cursor = job.cursor, "batch processing started");

        loop {
            let records = match source.fetch(job.cursor, job.chunk_size).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(batch_id = %id, cursor = job.cursor, error = %e, "batch source failed");
                    return self.finish(id, BatchStatus::Failed, Some(format!("source failed: {e}")));
                }
            };
            if records.is_empty() {
                return self.finish(id, BatchStatus::Completed, None);
            }

            let fetched = records.len();
            let token = self.monitor.start_timing("batch.chunk");
            let mut chunk_errors = 0u64;
            for record in records {
                if let Err(e) | Ok(Err(e)) = catch_unwind(handler.handle(record)).await {
                    chunk_errors += 1;
                    debug!(batch_id = %id, error = %e, "batch record failed");
                }
            }
            self.monitor.end_timing("batch.chunk", token, chunk_errors == 0);

            let threshold = self.config.error_rate_threshold;
            let min_records = self.config.min_records_for_error_rate;
            let (snapshot, stop) = self.update(id, |entry| {
                let job = &mut entry.job;
                job.cursor += fetched as u64;
                job.records_processed += fetched as u64;
                job.error_count += chunk_errors;
                job.updated_at = Utc::now();
                if let Some(total) = job.total_records.filter(|t| *t > 0) {
                    job.progress = (job.records_processed as f64 / total as f64 * 100.0).min(100.0);
                }
                Ok((job.clone(), entry.stop))
            })?;
            job = snapshot;
            debug!(
                batch_id = %id,
                records_processed = job.records_processed,
                error_count = job.error_count,
                progress = job.progress,
                "batch chunk processed"
            );

            if job.records_processed >= min_records && job.error_rate() > threshold {
                let message = format!(
                    "error rate {:.3} exceeds threshold {:.3}",
                    job.error_rate(),
                    threshold
                );
                warn!(batch_id = %id, error = %message, "batch job aborted");
                return self.finish(id, BatchStatus::Failed, Some(message));
            }
            if fetched < job.chunk_size {
                return self.finish(id, BatchStatus::Completed, None);
            }
            match stop {
                Some(StopRequest::Pause) => return self.settle(id, BatchStatus::Paused),
                Some(StopRequest::Cancel) => return self.finish(id, BatchStatus::Cancelled, None),
                None => {}
            }
        }
    }

    fn finish(&self, id: BatchJobId, status: BatchStatus, error: Option<String>) -> EngineResult<BatchJob> {
        let job = self.update(id, |entry| {
            entry.job.finish(status);
            entry.job.error = error;
            entry.stop = None;
            Ok(entry.job.clone())
        })?;
        info!(
            batch_id = %id,
            status = %status,
            records_processed = job.records_processed,
            error_count = job.error_count,
            "batch processing finished"
        );
        Ok(job)
    }

    fn settle(&self, id: BatchJobId, status: BatchStatus) -> EngineResult<BatchJob> {
        let job = self.update(id, |entry| {
            entry.job.status = status;
            entry.job.updated_at = Utc::now();
            entry.stop = None;
            Ok(entry.job.clone())
        })?;
        info!(batch_id = %id, status = %status, cursor = job.cursor, "batch processing suspended");
        Ok(job)
    }

    /// Pause a job. A running job stops after its current chunk.
    pub fn pause_batch_job(&self, id: BatchJobId) -> EngineResult<BatchJob> {
        self.update(id, |entry| match entry.job.status {
            BatchStatus::Pending => {
                entry.job.status = BatchStatus::Paused;
                entry.job.updated_at = Utc::now();
                Ok(entry.job.clone())
            }
            BatchStatus::Running => {
                entry.stop = Some(StopRequest::Pause);
                Ok(entry.job.clone())
            }
            BatchStatus::Paused => Ok(entry.job.clone()),
            other => Err(EngineError::invalid_transition(other, BatchStatus::Paused)),
        })
    }

    /// Cancel a job. A running job stops after its current chunk.
    pub fn cancel_batch_job(&self, id: BatchJobId) -> EngineResult<BatchJob> {
        let job = self.update(id, |entry| match entry.job.status {
            BatchStatus::Pending | BatchStatus::Paused | BatchStatus::Failed => {
                entry.job.finish(BatchStatus::Cancelled);
                Ok(entry.job.clone())
            }
            BatchStatus::Running => {
                entry.stop = Some(StopRequest::Cancel);
                Ok(entry.job.clone())
            }
            other => Err(EngineError::invalid_transition(other, BatchStatus::Cancelled)),
        })?;
        info!(batch_id = %id, status = %job.status, "batch job cancel requested");
        Ok(job)
    }

    /// Reset a failed job to `pending` for another run.
    pub fn retry_failed_batch_job(&self, id: BatchJobId) -> EngineResult<BatchJob> {
        let job = self.update(id, |entry| {
            let job = &mut entry.job;
            if job.status != BatchStatus::Failed {
                return Err(EngineError::invalid_transition(job.status, BatchStatus::Pending));
            }
            if job.retry_count >= job.max_retries {
                return Err(EngineError::RetryExhausted {
                    id: id.to_string(),
                    max_retries: job.max_retries,
                });
            }
            job.status = BatchStatus::Pending;
            job.retry_count += 1;
            job.progress = 0.0;
            job.records_processed = 0;
            job.error_count = 0;
            job.cursor = 0;
            job.started_at = None;
            job.completed_at = None;
            job.error = None;
            job.updated_at = Utc::now();
            entry.stop = None;
            Ok(job.clone())
        })?;
        info!(batch_id = %id, retry_count = job.retry_count, max_retries = job.max_retries, "batch job reset for retry");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn processor() -> BatchProcessor {
        BatchProcessor::new(
            BatchConfig::default()
                .with_error_rate_threshold(0.2)
                .with_min_records_for_error_rate(5),
            Arc::new(PerformanceMonitor::default()),
        )
    }

    fn records(n: u64) -> VecSource {
        VecSource::new((0..n).map(|i| json!({"row": i})).collect())
    }

    fn row(record: &serde_json::Value) -> u64 {
        record["row"].as_u64().unwrap_or_default()
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let err = processor()
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn processes_all_chunks_and_times_them() {
        let processor = processor();
        let job = processor
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(4))
            .unwrap();

        let handler = |_record: serde_json::Value| async { Ok::<_, HandlerError>(()) };
        let done = processor
            .start_batch_processing(job.id, &records(10), &handler)
            .await
            .unwrap();

        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.records_processed, 10);
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.cursor, 10);
        assert!(done.completed_at.is_some());
        let chunks = processor.monitor.get_operation_metrics("batch.chunk").unwrap();
        assert_eq!(chunks.count, 3);
    }

    #[tokio::test]
    async fn isolated_record_failures_do_not_abort() {
        let processor = processor();
        let job = processor
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(5))
            .unwrap();

        let handler = |record: serde_json::Value| async move {
            if row(&record) == 3 {
                Err(HandlerError::validation("bad row"))
            } else {
                Ok(())
            }
        };
        let done = processor
            .start_batch_processing(job.id, &records(20), &handler)
            .await
            .unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.error_count, 1);
    }

    #[tokio::test]
    async fn panicking_record_counts_as_an_error() {
        let processor = processor();
        let job = processor
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(5))
            .unwrap();
        let handled = AtomicUsize::new(0);

        let handler = |record: serde_json::Value| {
            handled.fetch_add(1, Ordering::SeqCst);
            async move {
                if row(&record) == 7 {
                    panic!("corrupt row");
                }
                Ok::<_, HandlerError>(())
            }
        };
        let done = processor
            .start_batch_processing(job.id, &records(20), &handler)
            .await
            .unwrap();

        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.records_processed, 20);
        assert_eq!(done.error_count, 1);
        assert_eq!(handled.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn error_rate_above_threshold_fails_the_job() {
        let processor = processor();
        let job = processor
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(5))
            .unwrap();

        let handler = |record: serde_json::Value| async move {
            if row(&record) % 2 == 0 {
                Err(HandlerError::transient("downstream"))
            } else {
                Ok(())
            }
        };
        let failed = processor
            .start_batch_processing(job.id, &records(50), &handler)
            .await
            .unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.records_processed, 5);
        assert!(failed.error.unwrap().contains("error rate"));
    }

    #[tokio::test]
    async fn retry_resets_counters_until_exhausted() {
        let processor = processor();
        let job = processor
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(5).with_max_retries(1))
            .unwrap();
        let handler = |_record: serde_json::Value| async { Err::<(), _>(HandlerError::transient("down")) };

        processor
            .start_batch_processing(job.id, &records(10), &handler)
            .await
            .unwrap();
        let retried = processor.retry_failed_batch_job(job.id).unwrap();
        assert_eq!(retried.status, BatchStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.progress, 0.0);
        assert_eq!(retried.records_processed, 0);
        assert_eq!(retried.cursor, 0);

        processor
            .start_batch_processing(job.id, &records(10), &handler)
            .await
            .unwrap();
        let err = processor.retry_failed_batch_job(job.id).unwrap_err();
        assert!(matches!(err, EngineError::RetryExhausted { max_retries: 1, .. }));
    }

    #[tokio::test]
    async fn retry_requires_failed_status() {
        let processor = processor();
        let job = processor.create_batch_job(BatchJobSpec::new("import")).unwrap();
        let err = processor.retry_failed_batch_job(job.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        assert!(processor.retry_failed_batch_job(BatchJobId::new()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn pause_takes_effect_between_chunks_and_resume_continues() {
        let processor = Arc::new(processor());
        let job = processor
            .create_batch_job(BatchJobSpec::new("import").with_chunk_size(2))
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let pauser = processor.clone();
        let counter = seen.clone();
        let id = job.id;
        let handler = move |_record: serde_json::Value| {
            let counter = counter.clone();
            let pauser = pauser.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    pauser.pause_batch_job(id).map_err(|e| HandlerError::permanent(e.to_string()))?;
                }
                Ok::<_, HandlerError>(())
            }
        };

        let paused = processor
            .start_batch_processing(id, &records(6), &handler)
            .await
            .unwrap();
        assert_eq!(paused.status, BatchStatus::Paused);
        assert_eq!(paused.cursor, 2);

        let done = processor
            .start_batch_processing(id, &records(6), &handler)
            .await
            .unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.records_processed, 6);
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn cancel_of_pending_job_is_immediate() {
        let processor = processor();
        let job = processor.create_batch_job(BatchJobSpec::new("import")).unwrap();
        let cancelled = processor.cancel_batch_job(job.id).unwrap();
        assert_eq!(cancelled.status, BatchStatus::Cancelled);

        let handler = |_record: serde_json::Value| async { Ok::<_, HandlerError>(()) };
        let err = processor
            .start_batch_processing(job.id, &records(1), &handler)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[test]
    fn pending_jobs_are_ordered_by_creation() {
        let processor = processor();
        let a = processor.create_batch_job(BatchJobSpec::new("a")).unwrap();
        let b = processor.create_batch_job(BatchJobSpec::new("b")).unwrap();
        let c = processor.create_batch_job(BatchJobSpec::new("c")).unwrap();
        processor.cancel_batch_job(b.id).unwrap();

        let pending: Vec<_> = processor.get_pending_batch_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(pending, vec![a.id, c.id]);
    }
}
