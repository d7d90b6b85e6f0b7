//! Stream processors.
//!
//! A flush swaps the whole buffer for an empty one inside a short critical
//! section, then feeds the taken records to the handler one by one. Records
//! arriving during a flush land in the fresh buffer and belong to the next
//! flush. A per-stream async mutex serializes flushes, whatever triggered them.
//! A timer tick that finds a flush in progress is skipped. A panicking
//! handler fails only the record it was given.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use riskwatch_core::{EngineError, EngineResult, HandlerError, StreamId, catch_unwind};
use riskwatch_observability::PerformanceMonitor;

use crate::timer::FlushTimer;

/// Per-stream configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffer length that triggers a flush while running.
    pub buffer_size: usize,
    /// Period of the time-triggered flush.
    pub flush_interval: Duration,
    /// Hard cap on buffered records; further records are rejected.
    pub max_buffered_records: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval: Duration::from_secs(5),
            max_buffered_records: 10_000,
        }
    }
}

impl StreamConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_buffered_records(mut self, max: usize) -> Self {
        self.max_buffered_records = max;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.buffer_size == 0 {
            return Err(EngineError::validation("stream buffer size must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(EngineError::validation("stream flush interval must be positive"));
        }
        if self.max_buffered_records < self.buffer_size {
            return Err(EngineError::validation(
                "max buffered records must be at least the buffer size",
            ));
        }
        Ok(())
    }
}

/// Stream lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Initialized,
    Running,
    Paused,
    Stopped,
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Stop,
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushReport {
    pub stream_id: StreamId,
    pub records: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub trigger: FlushTrigger,
    pub duration: Duration,
    pub flushed_at: DateTime<Utc>,
}

/// Acknowledgement of an added record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAck {
    /// Buffered records after this call (and after any flush it triggered).
    pub buffer_length: usize,
    /// The size-triggered flush this record caused, if any.
    pub flushed: Option<FlushReport>,
}

/// Per-stream counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub records_received: u64,
    /// Records handed to the handler, successful or not.
    pub records_processed: u64,
    pub errors: u64,
    pub flushes: u64,
    pub last_activity: Option<DateTime<Utc>>,
    /// Most recent flush that carried records.
    pub last_flush: Option<FlushReport>,
}

/// Snapshot of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub id: StreamId,
    pub config: StreamConfig,
    pub status: StreamStatus,
    pub buffered: usize,
    pub metrics: StreamMetrics,
    pub created_at: DateTime<Utc>,
}

/// Record handler of a stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn process(&self, record: serde_json::Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process(&self, record: serde_json::Value) -> Result<(), HandlerError> {
        (self)(record).await
    }
}

struct StreamSlot {
    status: StreamStatus,
    buffer: Vec<serde_json::Value>,
    metrics: StreamMetrics,
    handler: Option<Arc<dyn StreamHandler>>,
    timer: Option<FlushTimer>,
}

struct Stream {
    id: StreamId,
    config: StreamConfig,
    created_at: DateTime<Utc>,
    slot: Mutex<StreamSlot>,
    flushing: tokio::sync::Mutex<()>,
    monitor: Arc<PerformanceMonitor>,
}

impl Stream {
    fn slot(&self) -> MutexGuard<'_, StreamSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> StreamState {
        let slot = self.slot();
        StreamState {
            id: self.id.clone(),
            config: self.config.clone(),
            status: slot.status,
            buffered: slot.buffer.len(),
            metrics: slot.metrics.clone(),
            created_at: self.created_at,
        }
    }

    fn arm_timer(self: &Arc<Self>) -> FlushTimer {
        let weak = Arc::downgrade(self);
        FlushTimer::start(self.config.flush_interval, move || {
            let Some(stream) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            // Flush on its own task: aborting the timer must never cut a flush short.
            tokio::spawn(async move {
                let Ok(_flushing) = stream.flushing.try_lock() else {
                    debug!(stream_id = %stream.id, "flush in progress, timer tick skipped");
                    return;
                };
                if let Err(e) = stream.flush_locked(FlushTrigger::Timer).await {
                    warn!(stream_id = %stream.id, error = %e, "timed stream flush failed");
                }
            });
            ControlFlow::Continue(())
        })
    }

    async fn flush(&self, trigger: FlushTrigger) -> EngineResult<FlushReport> {
        let _flushing = self.flushing.lock().await;
        self.flush_locked(trigger).await
    }

    /// Caller holds `flushing`.
    async fn flush_locked(&self, trigger: FlushTrigger) -> EngineResult<FlushReport> {
        let (records, handler) = {
            let mut slot = self.slot();
            let Some(handler) = slot.handler.clone() else {
                return Err(EngineError::validation(format!(
                    "stream {} has no handler; start it before flushing",
                    self.id
                )));
            };
            (std::mem::take(&mut slot.buffer), handler)
        };

        let started = Instant::now();
        let mut report = FlushReport {
            stream_id: self.id.clone(),
            records: records.len(),
            succeeded: 0,
            failed: 0,
            trigger,
            duration: Duration::ZERO,
            flushed_at: Utc::now(),
        };
        if records.is_empty() {
            return Ok(report);
        }

        let token = self.monitor.start_timing("stream.flush");
        for record in records {
            match catch_unwind(handler.process(record)).await {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(e)) | Err(e) => {
                    report.failed += 1;
                    debug!(stream_id = %self.id, error = %e, "stream record failed");
                }
            }
        }
        self.monitor.end_timing("stream.flush", token, report.failed == 0);
        report.duration = started.elapsed();
        report.flushed_at = Utc::now();

        {
            let mut slot = self.slot();
            let metrics = &mut slot.metrics;
            metrics.records_processed += report.records as u64;
            metrics.errors += report.failed as u64;
            metrics.flushes += 1;
            metrics.last_activity = Some(report.flushed_at);
            metrics.last_flush = Some(report.clone());
        }
        debug!(
            stream_id = %self.id,
            records = report.records,
            failed = report.failed,
            trigger = ?trigger,
            "stream buffer flushed"
        );
        Ok(report)
    }
}

fn rejected(status: StreamStatus, action: &str) -> EngineError {
    EngineError::InvalidStateTransition {
        from: format!("{status:?}").to_lowercase(),
        to: action.to_string(),
    }
}

/// Registry of stream processors.
#[derive(Default)]
pub struct StreamProcessor {
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
    monitor: Arc<PerformanceMonitor>,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("streams", &self.list_streams().len())
            .finish()
    }
}

impl StreamProcessor {
    pub fn new(monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            monitor,
        }
    }

    fn stream(&self, id: &StreamId) -> EngineResult<Arc<Stream>> {
        self.streams
            .read()
            .map_err(|_| EngineError::storage("stream registry lock poisoned"))?
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("stream", id))
    }

    pub fn create_stream_processor(&self, id: StreamId, config: StreamConfig) -> EngineResult<StreamState> {
        config.validate()?;
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EngineError::storage("stream registry lock poisoned"))?;
        if streams.contains_key(&id) {
            return Err(EngineError::validation(format!("stream {id} already exists")));
        }

        let stream = Arc::new(Stream {
            id: id.clone(),
            config,
            created_at: Utc::now(),
            slot: Mutex::new(StreamSlot {
                status: StreamStatus::Initialized,
                buffer: Vec::new(),
                metrics: StreamMetrics::default(),
                handler: None,
                timer: None,
            }),
            flushing: tokio::sync::Mutex::new(()),
            monitor: self.monitor.clone(),
        });
        let state = stream.state();
        streams.insert(id.clone(), stream);
        info!(
            stream_id = %id,
            buffer_size = state.config.buffer_size,
            flush_interval_ms = state.config.flush_interval.as_millis() as u64,
            "stream processor created"
        );
        Ok(state)
    }

    /// `initialized → running`: installs the handler and arms the flush timer.
    pub fn start_stream_processing<H>(&self, id: &StreamId, handler: H) -> EngineResult<StreamState>
    where
        H: StreamHandler + 'static,
    {
        let stream = self.stream(id)?;
        let overdue = {
            let mut slot = stream.slot();
            if slot.status != StreamStatus::Initialized {
                return Err(rejected(slot.status, "running"));
            }
            slot.status = StreamStatus::Running;
            slot.handler = Some(Arc::new(handler));
            slot.timer = Some(stream.arm_timer());
            slot.buffer.len() >= stream.config.buffer_size
        };
        if overdue {
            spawn_flush(stream.clone(), FlushTrigger::Size);
        }
        info!(stream_id = %id, "stream processing started");
        Ok(stream.state())
    }

    /// Buffer a record, flushing inline when a running stream's buffer fills up.
    pub async fn add_data_to_stream(&self, id: &StreamId, record: serde_json::Value) -> EngineResult<StreamAck> {
        let stream = self.stream(id)?;
        let (buffer_length, should_flush) = {
            let mut slot = stream.slot();
            if slot.status == StreamStatus::Stopped {
                return Err(rejected(slot.status, "buffering"));
            }
            if slot.buffer.len() >= stream.config.max_buffered_records {
                warn!(
                    stream_id = %id,
                    buffered = slot.buffer.len(),
                    "stream record rejected: buffer full"
                );
                return Err(EngineError::backpressure(format!(
                    "stream {id} holds {} buffered records",
                    slot.buffer.len()
                )));
            }
            slot.buffer.push(record);
            slot.metrics.records_received += 1;
            slot.metrics.last_activity = Some(Utc::now());
            let len = slot.buffer.len();
            (len, slot.status == StreamStatus::Running && len >= stream.config.buffer_size)
        };

        if !should_flush {
            return Ok(StreamAck {
                buffer_length,
                flushed: None,
            });
        }
        let report = stream.flush(FlushTrigger::Size).await?;
        Ok(StreamAck {
            buffer_length: stream.slot().buffer.len(),
            flushed: Some(report),
        })
    }

    /// Flush now, regardless of fill level.
    pub async fn flush_stream_buffer(&self, id: &StreamId) -> EngineResult<FlushReport> {
        self.stream(id)?.flush(FlushTrigger::Manual).await
    }

    /// `running → paused`: disarms the timer, keeps the buffer.
    pub fn pause_stream(&self, id: &StreamId) -> EngineResult<StreamState> {
        let stream = self.stream(id)?;
        let timer = {
            let mut slot = stream.slot();
            if slot.status != StreamStatus::Running {
                return Err(rejected(slot.status, "paused"));
            }
            slot.status = StreamStatus::Paused;
            slot.timer.take()
        };
        drop(timer);
        info!(stream_id = %id, "stream paused");
        Ok(stream.state())
    }

    /// `paused → running`: re-arms the timer.
    pub fn resume_stream(&self, id: &StreamId) -> EngineResult<StreamState> {
        let stream = self.stream(id)?;
        let overdue = {
            let mut slot = stream.slot();
            if slot.status != StreamStatus::Paused {
                return Err(rejected(slot.status, "running"));
            }
            slot.status = StreamStatus::Running;
            slot.timer = Some(stream.arm_timer());
            slot.buffer.len() >= stream.config.buffer_size
        };
        if overdue {
            spawn_flush(stream.clone(), FlushTrigger::Size);
        }
        info!(stream_id = %id, "stream resumed");
        Ok(stream.state())
    }

    /// Disarm the timer, drain the buffer in a final flush and mark the stream stopped.
    pub async fn stop_stream(&self, id: &StreamId) -> EngineResult<FlushReport> {
        let stream = self.stream(id)?;
        let (timer, has_handler) = {
            let mut slot = stream.slot();
            if slot.status == StreamStatus::Stopped {
                return Err(rejected(slot.status, "stopped"));
            }
            slot.status = StreamStatus::Stopped;
            (slot.timer.take(), slot.handler.is_some())
        };
        drop(timer);

        let report = if has_handler {
            stream.flush(FlushTrigger::Stop).await?
        } else {
            let discarded = std::mem::take(&mut stream.slot().buffer);
            if !discarded.is_empty() {
                warn!(stream_id = %id, records = discarded.len(), "stream stopped before start; buffer discarded");
            }
            FlushReport {
                stream_id: id.clone(),
                records: 0,
                succeeded: 0,
                failed: 0,
                trigger: FlushTrigger::Stop,
                duration: Duration::ZERO,
                flushed_at: Utc::now(),
            }
        };
        info!(stream_id = %id, final_records = report.records, "stream stopped");
        Ok(report)
    }

    pub fn get_stream_state(&self, id: &StreamId) -> EngineResult<StreamState> {
        Ok(self.stream(id)?.state())
    }

    /// All streams, ordered by id.
    pub fn list_streams(&self) -> Vec<StreamState> {
        let streams: Vec<Arc<Stream>> = match self.streams.read() {
            Ok(streams) => streams.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let mut states: Vec<StreamState> = streams.iter().map(|s| s.state()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Stop (if needed) and forget a stream.
    pub async fn remove_stream(&self, id: &StreamId) -> EngineResult<StreamState> {
        let stream = self.stream(id)?;
        if stream.slot().status != StreamStatus::Stopped {
            self.stop_stream(id).await?;
        }
        self.streams
            .write()
            .map_err(|_| EngineError::storage("stream registry lock poisoned"))?
            .remove(id);
        info!(stream_id = %id, "stream removed");
        Ok(stream.state())
    }

    /// Stop every stream that is not stopped yet.
    pub async fn shutdown(&self) {
        for state in self.list_streams() {
            if state.status == StreamStatus::Stopped {
                continue;
            }
            if let Err(e) = self.stop_stream(&state.id).await {
                warn!(stream_id = %state.id, error = %e, "failed to stop stream during shutdown");
            }
        }
    }
}

fn spawn_flush(stream: Arc<Stream>, trigger: FlushTrigger) {
    tokio::spawn(async move {
        if let Err(e) = stream.flush(trigger).await {
            warn!(stream_id = %stream.id, error = %e, "stream flush failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn id(name: &str) -> StreamId {
        StreamId::parse(name).unwrap()
    }

    fn processor() -> StreamProcessor {
        StreamProcessor::new(Arc::new(PerformanceMonitor::default()))
    }

    fn counting(counter: Arc<AtomicUsize>) -> impl StreamHandler + 'static {
        move |_record: serde_json::Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        }
    }

    #[test]
    fn invalid_configs_and_duplicates_are_rejected() {
        let processor = processor();
        let zero = StreamConfig::default().with_buffer_size(0);
        assert!(matches!(
            processor.create_stream_processor(id("kyc"), zero),
            Err(EngineError::Validation(_))
        ));
        let no_interval = StreamConfig::default().with_flush_interval(Duration::ZERO);
        assert!(processor.create_stream_processor(id("kyc"), no_interval).is_err());

        processor.create_stream_processor(id("kyc"), StreamConfig::default()).unwrap();
        assert!(matches!(
            processor.create_stream_processor(id("kyc"), StreamConfig::default()),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_exactly_the_full_buffer() {
        let processor = processor();
        let stream = id("payments");
        let config = StreamConfig::default()
            .with_buffer_size(3)
            .with_flush_interval(Duration::from_secs(5));
        processor.create_stream_processor(stream.clone(), config).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        processor.start_stream_processing(&stream, counting(seen.clone())).unwrap();

        let first = processor.add_data_to_stream(&stream, json!(1)).await.unwrap();
        assert_eq!((first.buffer_length, first.flushed.is_none()), (1, true));
        processor.add_data_to_stream(&stream, json!(2)).await.unwrap();
        let third = processor.add_data_to_stream(&stream, json!(3)).await.unwrap();

        let report = third.flushed.unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.trigger, FlushTrigger::Size);
        assert_eq!(third.buffer_length, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_buffer() {
        let processor = processor();
        let stream = id("payments");
        let config = StreamConfig::default()
            .with_buffer_size(3)
            .with_flush_interval(Duration::from_secs(5));
        processor.create_stream_processor(stream.clone(), config).unwrap();
        processor
            .start_stream_processing(&stream, counting(Arc::new(AtomicUsize::new(0))))
            .unwrap();

        processor.add_data_to_stream(&stream, json!("late")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        let state = processor.get_stream_state(&stream).unwrap();
        let last = state.metrics.last_flush.unwrap();
        assert_eq!(last.records, 1);
        assert_eq!(last.trigger, FlushTrigger::Timer);
        assert_eq!(state.buffered, 0);
    }

    #[tokio::test]
    async fn failures_are_counted_not_thrown() {
        let processor = processor();
        let stream = id("alerts");
        processor
            .create_stream_processor(stream.clone(), StreamConfig::default())
            .unwrap();
        processor
            .start_stream_processing(&stream, |record: serde_json::Value| async move {
                if record["ok"].as_bool() == Some(true) {
                    Ok(())
                } else {
                    Err(HandlerError::validation("malformed event"))
                }
            })
            .unwrap();

        for ok in [true, false, true, false, false] {
            processor.add_data_to_stream(&stream, json!({"ok": ok})).await.unwrap();
        }
        let report = processor.flush_stream_buffer(&stream).await.unwrap();
        assert_eq!((report.records, report.succeeded, report.failed), (5, 2, 3));

        let metrics = processor.get_stream_state(&stream).unwrap().metrics;
        assert_eq!(metrics.records_processed, 5);
        assert_eq!(metrics.errors, 3);
        assert_eq!(metrics.flushes, 1);
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_record() {
        let processor = processor();
        let stream = id("sanctions");
        let config = StreamConfig::default().with_buffer_size(3);
        processor.create_stream_processor(stream.clone(), config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        processor
            .start_stream_processing(&stream, move |record: serde_json::Value| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if record["n"].as_u64() == Some(0) {
                        panic!("unparseable counterparty");
                    }
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();

        let mut last = None;
        for n in 0..3 {
            last = Some(processor.add_data_to_stream(&stream, json!({ "n": n })).await.unwrap());
        }
        let report = last.unwrap().flushed.unwrap();
        assert_eq!((report.records, report.succeeded, report.failed), (3, 2, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let state = processor.get_stream_state(&stream).unwrap();
        assert_eq!(state.buffered, 0);
        assert_eq!(state.metrics.records_processed, 3);
        assert_eq!(state.metrics.errors, 1);
        assert_eq!(state.metrics.flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_skips_ticks_while_a_slow_flush_runs() {
        let processor = processor();
        let stream = id("watchlist");
        let config = StreamConfig::default()
            .with_buffer_size(100)
            .with_flush_interval(Duration::from_secs(5));
        processor.create_stream_processor(stream.clone(), config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        processor
            .start_stream_processing(&stream, move |_record: serde_json::Value| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(12)).await;
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();

        // The tick at 5s starts a flush that runs until 17s.
        processor.add_data_to_stream(&stream, json!("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        processor.add_data_to_stream(&stream, json!("b")).await.unwrap();

        // Ticks at 10s and 15s found the flush busy and were dropped.
        tokio::time::sleep(Duration::from_secs(12)).await;
        let state = processor.get_stream_state(&stream).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.buffered, 1);
        assert_eq!(state.metrics.flushes, 1);

        // The tick at 20s picks up the second record.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(processor.get_stream_state(&stream).unwrap().buffered, 0);
    }

    #[tokio::test]
    async fn data_is_buffered_while_initialized_or_paused() {
        let processor = processor();
        let stream = id("trades");
        let config = StreamConfig::default().with_buffer_size(2);
        processor.create_stream_processor(stream.clone(), config).unwrap();

        for i in 0..3 {
            let ack = processor.add_data_to_stream(&stream, json!(i)).await.unwrap();
            assert!(ack.flushed.is_none());
        }
        assert_eq!(processor.get_stream_state(&stream).unwrap().buffered, 3);

        let seen = Arc::new(AtomicUsize::new(0));
        processor.start_stream_processing(&stream, counting(seen.clone())).unwrap();
        processor.pause_stream(&stream).unwrap();
        assert_eq!(
            processor.get_stream_state(&stream).unwrap().status,
            StreamStatus::Paused
        );
        let ack = processor.add_data_to_stream(&stream, json!(99)).await.unwrap();
        assert!(ack.flushed.is_none());

        let report = processor.stop_stream(&stream).await.unwrap();
        assert_eq!(report.trigger, FlushTrigger::Stop);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn backpressure_when_buffer_cap_is_reached() {
        let processor = processor();
        let stream = id("bulk");
        let config = StreamConfig::default()
            .with_buffer_size(2)
            .with_max_buffered_records(2);
        processor.create_stream_processor(stream.clone(), config).unwrap();

        processor.add_data_to_stream(&stream, json!(1)).await.unwrap();
        processor.add_data_to_stream(&stream, json!(2)).await.unwrap();
        let err = processor.add_data_to_stream(&stream, json!(3)).await.unwrap_err();
        assert!(matches!(err, EngineError::Backpressure(_)));
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let processor = processor();
        let stream = id("audit");
        assert!(
            processor
                .add_data_to_stream(&stream, json!(1))
                .await
                .unwrap_err()
                .is_not_found()
        );

        processor.create_stream_processor(stream.clone(), StreamConfig::default()).unwrap();
        assert!(matches!(
            processor.pause_stream(&stream),
            Err(EngineError::InvalidStateTransition { .. })
        ));
        processor.stop_stream(&stream).await.unwrap();

        let err = processor.add_data_to_stream(&stream, json!(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { ref from, .. } if from == "stopped"));
        assert!(processor.stop_stream(&stream).await.is_err());
    }

    #[tokio::test]
    async fn remove_stops_and_forgets() {
        let processor = processor();
        let stream = id("audit");
        processor.create_stream_processor(stream.clone(), StreamConfig::default()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        processor.start_stream_processing(&stream, counting(seen.clone())).unwrap();
        processor.add_data_to_stream(&stream, json!(1)).await.unwrap();

        let removed = processor.remove_stream(&stream).await.unwrap();
        assert_eq!(removed.status, StreamStatus::Stopped);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(processor.list_streams().is_empty());
        assert!(processor.get_stream_state(&stream).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn arrivals_during_a_flush_land_in_the_next_buffer() {
        let processor = Arc::new(processor());
        let stream = id("ledger");
        processor.create_stream_processor(stream.clone(), StreamConfig::default()).unwrap();

        let gate = Arc::new(tokio::sync::Notify::new());
        let entered = Arc::new(tokio::sync::Notify::new());
        let (g, e) = (gate.clone(), entered.clone());
        processor
            .start_stream_processing(&stream, move |_record: serde_json::Value| {
                let (g, e) = (g.clone(), e.clone());
                async move {
                    e.notify_one();
                    g.notified().await;
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();

        processor.add_data_to_stream(&stream, json!("a")).await.unwrap();
        let flusher = {
            let processor = processor.clone();
            let stream = stream.clone();
            tokio::spawn(async move { processor.flush_stream_buffer(&stream).await })
        };
        entered.notified().await;
        let ack = processor.add_data_to_stream(&stream, json!("b")).await.unwrap();
        assert_eq!(ack.buffer_length, 1);
        gate.notify_one();

        let first = flusher.await.unwrap().unwrap();
        assert_eq!(first.records, 1);
        gate.notify_one();
        let second = processor.flush_stream_buffer(&stream).await.unwrap();
        assert_eq!(second.records, 1);
    }
}
