//! Buffered stream ingestion.
//!
//! Each stream buffers incoming records and hands them to its handler in
//! flushes, triggered by buffer size, by a periodic [`FlushTimer`], manually,
//! or by `stop`. Flushes of one stream never overlap.

pub mod processor;
pub mod timer;

pub use processor::{
    FlushReport, FlushTrigger, StreamAck, StreamConfig, StreamHandler, StreamMetrics,
    StreamProcessor, StreamState, StreamStatus,
};
pub use timer::FlushTimer;
