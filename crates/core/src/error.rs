//! Engine error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the engine crates.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error.
///
/// Every public operation resolves to either a value or one of these typed
/// rejections. Handler failures are always wrapped, never surfaced raw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Bad input (malformed payload, unknown job type, zero-sized config).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown job, batch job, stream or alert id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The requested transition is not allowed from the current state.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A job or stream handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The retry budget of a job is spent.
    #[error("retries exhausted for {id} (max {max_retries})")]
    RetryExhausted { id: String, max_retries: u32 },

    /// Capacity reached; the work was rejected instead of queued.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The backing store failed (e.g. a poisoned lock).
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(from: impl core::fmt::Debug, to: impl core::fmt::Debug) -> Self {
        Self::InvalidStateTransition {
            from: format!("{from:?}").to_lowercase(),
            to: format!("{to:?}").to_lowercase(),
        }
    }

    pub fn backpressure(msg: impl Into<String>) -> Self {
        Self::Backpressure(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Likely to succeed on a later attempt (I/O hiccup, lock contention).
    Transient,
    /// Will fail again no matter how often it is retried.
    Permanent,
    /// The job payload itself is invalid.
    Validation,
    /// A downstream resource is saturated.
    ResourceExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Validation => "validation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by a job, batch or stream handler.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} handler error: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }
}

/// Untyped handler failures are assumed transient.
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }
}
