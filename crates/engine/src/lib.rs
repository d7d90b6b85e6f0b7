//! `riskwatch-engine`: wires the job queue, status tracking, batch and stream
//! processing, performance monitoring and alerting into one runtime.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use riskwatch_engine::{Engine, EngineConfig};
//!
//! riskwatch_observability::init();
//! let engine = Engine::start(EngineConfig::from_env()?)?;
//! engine.queue().register("compliance_check", |_ctx: riskwatch_jobs::JobContext| async {
//!     Ok::<_, riskwatch_core::HandlerError>(serde_json::json!({ "ok": true }))
//! })?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;

pub use config::EngineConfig;
pub use engine::{CleanupReport, Engine};
