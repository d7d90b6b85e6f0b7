//! Job status tracking.
//!
//! The service owns one [`JobStatusRecord`] per live job. A record follows the
//! state machine encoded in [`JobStatus::can_transition_to`]; as soon as it
//! reaches a terminal status it is moved into the history store and removed
//! from the active set. Both steps run under one lock, so a reader always
//! finds the record in at least one of the two stores.
//!
//! Every transition is published as a [`JobStatusChanged`] on the optional
//! event bus, in transition order.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use riskwatch_core::{EngineError, EngineResult, JobId, Page, Pagination};
use riskwatch_events::EventBus;

use crate::store::{InMemoryStore, RecordStore};
use crate::types::{JobError, JobStatus, JobType};

/// Storage for active records.
pub type StatusStore = dyn RecordStore<JobId, JobStatusRecord>;

/// Storage for archived records.
pub type HistoryStore = dyn RecordStore<JobId, JobHistoryRecord>;

/// Resource snapshot reported alongside progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
}

/// Optional details of a progress report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: Option<String>,
    pub resource_usage: Option<ResourceUsage>,
}

impl ProgressUpdate {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            resource_usage: None,
        }
    }

    pub fn with_resource_usage(mut self, usage: ResourceUsage) -> Self {
        self.resource_usage = Some(usage);
        self
    }
}

/// Live status of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Percent complete, in [0, 100].
    pub progress: f64,
    pub stage: String,
    pub resource_usage: Option<ResourceUsage>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    pub retry_count: u32,
    pub error: Option<JobError>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusRecord {
    fn new(job_id: JobId, job_type: JobType, priority: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            job_type,
            status: JobStatus::Pending,
            progress: 0.0,
            stage: "queued".to_string(),
            resource_usage: None,
            estimated_completion: None,
            priority,
            retry_count: 0,
            error: None,
            cancel_reason: None,
            cancelled_at: None,
            created_at: now,
            started_at: None,
            updated_at: now,
        }
    }
}

/// Archived, immutable snapshot of a terminal job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    #[serde(flatten)]
    pub record: JobStatusRecord,
    /// Time from first start to the terminal transition; `None` if the job never ran.
    pub duration_ms: Option<u64>,
    pub archived_at: DateTime<Utc>,
}

impl JobHistoryRecord {
    fn archive(record: JobStatusRecord) -> Self {
        let archived_at = record.updated_at;
        let duration_ms = record
            .started_at
            .map(|started| (archived_at - started).num_milliseconds().max(0) as u64);
        Self {
            record,
            duration_ms,
            archived_at,
        }
    }
}

/// Published on every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusChanged {
    pub job_id: JobId,
    pub job_type: JobType,
    /// `None` when the record was just created.
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub retry_count: u32,
    pub error: Option<JobError>,
    pub at: DateTime<Utc>,
}

impl JobStatusChanged {
    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

/// Listing filter; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatusFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub priority: Option<String>,
}

impl JobStatusFilter {
    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn matches(&self, record: &JobStatusRecord) -> bool {
        self.job_type.as_ref().is_none_or(|t| *t == record.job_type)
            && self.status.is_none_or(|s| s == record.status)
            && self
                .priority
                .as_ref()
                .is_none_or(|p| record.priority.as_ref() == Some(p))
    }
}

/// Counts across the active set and history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: u64,
    pub archived: u64,
    /// Mean duration of archived jobs that ran at least once.
    pub average_duration_ms: Option<f64>,
}

/// Tracks job status records and archives terminal ones.
pub struct JobStatusService {
    active: Arc<StatusStore>,
    history: Arc<HistoryStore>,
    bus: Option<Arc<dyn EventBus<JobStatusChanged>>>,
    transitions: Mutex<()>,
}

impl std::fmt::Debug for JobStatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusService")
            .field("has_bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

impl JobStatusService {
    pub fn new(active: Arc<StatusStore>, history: Arc<HistoryStore>) -> Self {
        Self {
            active,
            history,
            bus: None,
            transitions: Mutex::new(()),
        }
    }

    /// Service backed by in-memory stores.
    pub fn in_memory() -> Self {
        Self::new(InMemoryStore::arc(), InMemoryStore::arc())
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus<JobStatusChanged>>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.transitions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, record: &JobStatusRecord, from: Option<JobStatus>) {
        let Some(bus) = &self.bus else { return };
        let event = JobStatusChanged {
            job_id: record.job_id,
            job_type: record.job_type.clone(),
            from,
            to: record.status,
            retry_count: record.retry_count,
            error: record.error.clone(),
            at: record.updated_at,
        };
        if let Err(e) = bus.publish(event) {
            warn!(job_id = %record.job_id, error = %e, "failed to publish job status change");
        }
    }

    /// Start tracking a job in `pending`.
    pub fn create(
        &self,
        job_id: JobId,
        job_type: JobType,
        priority: Option<String>,
    ) -> EngineResult<JobStatusRecord> {
        let _guard = self.lock();
        if self.history.get(&job_id)?.is_some() {
            return Err(EngineError::validation(format!("job {job_id} was already archived")));
        }
        let record = JobStatusRecord::new(job_id, job_type, priority);
        self.active
            .insert_new(job_id, record.clone())
            .map_err(|_| EngineError::validation(format!("job {job_id} is already tracked")))?;
        debug!(job_id = %job_id, job_type = %record.job_type, "job status created");
        self.publish(&record, None);
        Ok(record)
    }

    /// Why a transition of `job_id` found no active record.
    fn not_active(&self, job_id: JobId, to: JobStatus) -> EngineError {
        match self.history.get(&job_id) {
            Ok(Some(archived)) => EngineError::invalid_transition(archived.record.status, to),
            Ok(None) => EngineError::not_found("job", job_id),
            Err(e) => e.into(),
        }
    }

    fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        apply: impl FnOnce(&mut JobStatusRecord),
    ) -> EngineResult<JobStatusRecord> {
        let _guard = self.lock();
        let Some(mut record) = self.active.get(&job_id)? else {
            return Err(self.not_active(job_id, to));
        };
        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::invalid_transition(from, to));
        }

        record.status = to;
        record.updated_at = Utc::now();
        apply(&mut record);

        if to.is_terminal() {
            self.history
                .upsert(job_id, JobHistoryRecord::archive(record.clone()))?;
            self.active.delete(&job_id)?;
            info!(job_id = %job_id, status = %to, "job archived");
        } else {
            self.active.upsert(job_id, record.clone())?;
            debug!(job_id = %job_id, from = %from, to = %to, "job status changed");
        }

        self.publish(&record, Some(from));
        Ok(record)
    }

    /// `pending → running`.
    pub fn mark_running(&self, job_id: JobId) -> EngineResult<JobStatusRecord> {
        self.transition(job_id, JobStatus::Running, |r| {
            r.started_at.get_or_insert(r.updated_at);
            r.stage = "running".to_string();
        })
    }

    /// `running → pending` for another attempt. Progress starts over.
    pub fn mark_retrying(&self, job_id: JobId, error: JobError) -> EngineResult<JobStatusRecord> {
        self.transition(job_id, JobStatus::Pending, |r| {
            r.retry_count += 1;
            r.progress = 0.0;
            r.estimated_completion = None;
            r.stage = "retrying".to_string();
            r.error = Some(error);
        })
    }

    /// `running → completed`.
    pub fn complete(&self, job_id: JobId) -> EngineResult<JobStatusRecord> {
        self.transition(job_id, JobStatus::Completed, |r| {
            r.progress = 100.0;
            r.stage = "completed".to_string();
            r.estimated_completion = Some(r.updated_at);
        })
    }

    /// `running → failed`.
    pub fn fail(&self, job_id: JobId, error: JobError) -> EngineResult<JobStatusRecord> {
        self.transition(job_id, JobStatus::Failed, |r| {
            r.stage = "failed".to_string();
            r.estimated_completion = None;
            r.error = Some(error);
        })
    }

    /// Cancel a pending or running job.
    ///
    /// A terminal job is left untouched and yields `InvalidStateTransition`.
    pub fn cancel(&self, job_id: JobId, reason: Option<String>) -> EngineResult<JobStatusRecord> {
        let record = self.transition(job_id, JobStatus::Cancelled, |r| {
            r.stage = "cancelled".to_string();
            r.estimated_completion = None;
            r.cancel_reason = reason;
            r.cancelled_at = Some(r.updated_at);
        })?;
        info!(job_id = %job_id, reason = ?record.cancel_reason, "job cancelled");
        Ok(record)
    }

    /// Record progress of an active job.
    ///
    /// Progress is clamped to [0, 100]. Estimated completion is extrapolated
    /// linearly from the first start.
    pub fn update_progress(
        &self,
        job_id: JobId,
        progress: f64,
        update: ProgressUpdate,
    ) -> EngineResult<JobStatusRecord> {
        let _guard = self.lock();
        let Some(mut record) = self.active.get(&job_id)? else {
            return Err(EngineError::not_found("job", job_id));
        };

        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        let now = Utc::now();
        record.progress = progress;
        record.updated_at = now;
        if let Some(stage) = update.stage {
            record.stage = stage;
        }
        if update.resource_usage.is_some() {
            record.resource_usage = update.resource_usage;
        }
        record.estimated_completion = estimate_completion(record.started_at, now, progress);

        self.active.upsert(job_id, record.clone())?;
        Ok(record)
    }

    /// Active record, falling back to history.
    pub fn get(&self, job_id: JobId) -> EngineResult<JobStatusRecord> {
        if let Some(record) = self.active.get(&job_id)? {
            return Ok(record);
        }
        self.history
            .get(&job_id)?
            .map(|archived| archived.record)
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    pub fn get_history_record(&self, job_id: JobId) -> EngineResult<JobHistoryRecord> {
        self.history
            .get(&job_id)?
            .ok_or_else(|| EngineError::not_found("job history", job_id))
    }

    /// Active records, oldest first.
    pub fn get_all_job_statuses(
        &self,
        filter: &JobStatusFilter,
        pagination: Pagination,
    ) -> EngineResult<Page<JobStatusRecord>> {
        let mut records = self.active.query(&|r| filter.matches(r))?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        Ok(Page::slice(records, pagination))
    }

    /// Archived records, most recently archived first.
    pub fn get_job_history(
        &self,
        filter: &JobStatusFilter,
        pagination: Pagination,
    ) -> EngineResult<Page<JobHistoryRecord>> {
        let mut records = self.history.query(&|h| filter.matches(&h.record))?;
        records.sort_by(|a, b| {
            b.archived_at
                .cmp(&a.archived_at)
                .then(b.record.job_id.cmp(&a.record.job_id))
        });
        Ok(Page::slice(records, pagination))
    }

    pub fn statistics(&self) -> EngineResult<JobStatistics> {
        let active = self.active.query(&|_| true)?;
        let history = self.history.query(&|_| true)?;

        let mut stats = JobStatistics {
            active: active.len() as u64,
            archived: history.len() as u64,
            ..Default::default()
        };
        let statuses = active
            .iter()
            .map(|r| r.status)
            .chain(history.iter().map(|h| h.record.status));
        for status in statuses {
            match status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        let durations: Vec<u64> = history.iter().filter_map(|h| h.duration_ms).collect();
        if !durations.is_empty() {
            stats.average_duration_ms =
                Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64);
        }
        Ok(stats)
    }

    /// Drop archived records older than `older_than`. Returns how many were removed.
    pub fn cleanup_history(&self, older_than: DateTime<Utc>) -> EngineResult<usize> {
        let _guard = self.lock();
        let expired = self.history.query(&|h| h.archived_at < older_than)?;
        for archived in &expired {
            self.history.delete(&archived.record.job_id)?;
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), cutoff = %older_than, "job history cleaned up");
        }
        Ok(expired.len())
    }
}

fn estimate_completion(
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    progress: f64,
) -> Option<DateTime<Utc>> {
    let started_at = started_at?;
    if progress <= 0.0 {
        return None;
    }
    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
    let total_ms = elapsed_ms * 100.0 / progress;
    Some(started_at + chrono::Duration::milliseconds(total_ms.round() as i64))
}
