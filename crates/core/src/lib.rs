//! `riskwatch-core`: shared building blocks for the job engine.
//!
//! This crate contains identifiers, the error taxonomy, severity levels,
//! pagination primitives and handler panic isolation. It has no runtime or
//! I/O concerns.

pub mod error;
pub mod id;
pub mod page;
pub mod severity;
pub mod unwind;

pub use error::{EngineError, EngineResult, ErrorKind, HandlerError};
pub use id::{AlertId, BatchJobId, JobId, StreamId};
pub use page::{Page, Pagination};
pub use severity::Severity;
pub use unwind::{CatchUnwind, catch_unwind};
