//! Threshold-driven alerting.
//!
//! [`AlertService`] turns job failures and resource samples into alerts using
//! the rule table in [`rules`]. [`AlertMonitor`] feeds it from the job status
//! event stream and [`ResourceSampler`] from periodic host snapshots.

pub mod monitor;
pub mod rules;
pub mod service;

pub use monitor::{AlertMonitor, ResourceSampler};
pub use rules::{AlertThresholds, AlertType};
pub use service::{Alert, AlertEvent, AlertFilter, AlertService, AlertStatistics};
