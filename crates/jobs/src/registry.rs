//! Job-type → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use riskwatch_core::{EngineError, EngineResult, HandlerError, JobId};

use crate::status::{JobStatusService, ProgressUpdate};
use crate::types::JobType;

/// Context handed to a handler for one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    status: Arc<JobStatusService>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        job_type: JobType,
        payload: serde_json::Value,
        attempt: u32,
        status: Arc<JobStatusService>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            payload,
            attempt,
            status,
        }
    }

    /// Report progress for this job; see [`JobStatusService::update_progress`].
    pub fn report_progress(&self, progress: f64, update: ProgressUpdate) -> EngineResult<()> {
        self.status
            .update_progress(self.job_id, progress, update)
            .map(|_| ())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Async job handler.
///
/// Implemented for any `Fn(JobContext) -> impl Future<Output = Result<Value, HandlerError>>`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, HandlerError> {
        (self)(ctx).await
    }
}

/// Registered handlers, keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`. A type can be registered once.
    pub fn register(&self, job_type: JobType, handler: Arc<dyn JobHandler>) -> EngineResult<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| EngineError::storage("handler registry lock poisoned"))?;
        if handlers.contains_key(&job_type) {
            return Err(EngineError::validation(format!(
                "handler already registered for job type {job_type}"
            )));
        }
        debug!(job_type = %job_type, "job handler registered");
        handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().ok()?.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.get(job_type).is_some()
    }

    /// Registered types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
