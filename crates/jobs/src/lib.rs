//! Background job engine: bounded worker pool with retry/backoff, the job
//! status state machine with archival, and chunked batch processing.
//!
//! ## Components
//!
//! - [`JobQueue`]: FIFO admission, N concurrent workers, retry with backoff
//! - [`HandlerRegistry`]: job-type tag → async handler
//! - [`ErrorHandlingService`]: classifies handler failures, decides retry vs. fail
//! - [`JobStatusService`]: status records, progress, archival to history
//! - [`BatchProcessor`]: resumable chunked processing with an error-rate cutoff
//! - [`RecordStore`]: narrow storage seam (in-memory implementation included)

pub mod batch;
pub mod error_handling;
pub mod queue;
pub mod registry;
pub mod status;
pub mod store;
pub mod types;

pub use batch::{
    BatchConfig, BatchJob, BatchJobSpec, BatchProcessor, BatchSource, BatchStatus, RecordHandler,
    VecSource,
};
pub use error_handling::{ErrorHandlingService, ErrorStatistics, FailureClassification, RetryDecision};
pub use queue::{JobQueue, JobQueueConfig, QueueStats};
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use status::{
    JobHistoryRecord, JobStatistics, JobStatusChanged, JobStatusFilter, JobStatusRecord,
    JobStatusService, ProgressUpdate, ResourceUsage,
};
pub use store::{InMemoryStore, RecordStore, StoreError};
pub use types::{
    BackoffStrategy, Job, JobAttemptRecord, JobError, JobSnapshot, JobStatus, JobType, RetryPolicy,
    SubmitOptions,
};
