use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use riskwatch_alerts::AlertType;
use riskwatch_core::{EngineError, HandlerError, JobId, Pagination, Severity, StreamId};
use riskwatch_engine::{CleanupReport, Engine, EngineConfig};
use riskwatch_events::Subscription;
use riskwatch_jobs::{
    BatchJobSpec, BatchStatus, JobContext, JobQueueConfig, JobStatus, JobStatusChanged, JobStatusFilter,
    ProgressUpdate, RetryPolicy, VecSource,
};
use riskwatch_streams::{FlushTrigger, StreamConfig};

fn engine_with(queue: JobQueueConfig) -> Engine {
    let config = EngineConfig::default()
        .with_queue(queue)
        .with_resource_sample_interval(None);
    Engine::start(config).unwrap()
}

/// Waits until the status service has archived the job.
async fn wait_terminal(engine: &Engine, job_id: JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(archived) = engine.status().get_history_record(job_id) {
                return archived.record.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

/// Status changes of one job, in publish order, until it is terminal.
async fn transitions_of(events: &mut Subscription<JobStatusChanged>, job_id: JobId) -> Vec<JobStatus> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        if event.job_id != job_id {
            continue;
        }
        seen.push(event.to);
        if event.is_terminal() {
            break;
        }
    }
    seen
}

#[tokio::test]
async fn five_jobs_with_two_workers() {
    let engine = engine_with(JobQueueConfig::default().with_concurrency(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));

    let (r, p, s) = (running.clone(), peak.clone(), started.clone());
    engine
        .queue()
        .register("compliance_check", move |ctx: JobContext| {
            let (running, peak, started) = (r.clone(), p.clone(), s.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                started.lock().unwrap().push(ctx.job_id);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(json!({ "entity": ctx.payload["entity"] }))
            }
        })
        .unwrap();

    let ids: Vec<JobId> = (0..5)
        .map(|n| {
            engine
                .queue()
                .submit("compliance_check", json!({ "entity": n }))
                .unwrap()
        })
        .collect();

    for id in &ids {
        assert_eq!(wait_terminal(&engine, *id).await, JobStatus::Completed);
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let started = started.lock().unwrap().clone();
    assert_eq!(started.len(), 5);
    let first_two: HashSet<JobId> = started[..2].iter().copied().collect();
    assert_eq!(first_two, ids[..2].iter().copied().collect::<HashSet<_>>());

    let stats = engine.status().statistics().unwrap();
    assert_eq!(stats.completed, 5);
    engine.shutdown().await;
}

#[tokio::test]
async fn running_status_records_never_exceed_concurrency() {
    let engine = engine_with(JobQueueConfig::default().with_concurrency(2));
    engine
        .queue()
        .register("compliance_check", |_ctx: JobContext| async {
            tokio::time::sleep(Duration::from_millis(15)).await;
            Ok::<_, HandlerError>(json!(null))
        })
        .unwrap();

    let status = engine.status().clone();
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let sampler = {
        let done = done.clone();
        tokio::spawn(async move {
            let running = JobStatusFilter::default().status(JobStatus::Running);
            let mut peak = 0;
            while !done.load(Ordering::SeqCst) {
                let counted = status.statistics().unwrap().running;
                let listed = status
                    .get_all_job_statuses(&running, Pagination::default())
                    .unwrap()
                    .total;
                peak = peak.max(counted).max(listed);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            peak
        })
    };

    let ids: Vec<JobId> = (0..6)
        .map(|n| {
            engine
                .queue()
                .submit("compliance_check", json!({ "entity": n }))
                .unwrap()
        })
        .collect();
    for id in &ids {
        assert_eq!(wait_terminal(&engine, *id).await, JobStatus::Completed);
    }
    done.store(true, Ordering::SeqCst);

    let peak = sampler.await.unwrap();
    assert!(peak >= 1, "no running job was ever observed");
    assert!(peak <= 2, "{peak} status records were running at once");
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_and_restart_progress() {
    let policy = RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(10));
    let engine = engine_with(JobQueueConfig::default().with_retry_policy(policy.clone()));
    let starts = Arc::new(Mutex::new(Vec::new()));

    let (status, log) = (engine.status().clone(), starts.clone());
    engine
        .queue()
        .register("risk_assessment", move |ctx: JobContext| {
            let (status, log) = (status.clone(), log.clone());
            async move {
                let record = status.get(ctx.job_id).unwrap();
                log.lock().unwrap().push((
                    tokio::time::Instant::now(),
                    record.progress,
                    record.estimated_completion,
                ));
                ctx.report_progress(80.0, ProgressUpdate::stage("scoring")).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<serde_json::Value, _>(HandlerError::transient("scoring service unavailable"))
            }
        })
        .unwrap();

    let mut events = engine.subscribe_status_changes();
    let id = engine.queue().submit("risk_assessment", json!({ "entity": "acme" })).unwrap();

    // The record is back to zero as soon as the retry is scheduled.
    while let Some(event) = events.recv().await {
        if event.job_id == id && event.from == Some(JobStatus::Running) {
            assert_eq!(event.to, JobStatus::Pending);
            break;
        }
    }
    let retried = engine.status().get(id).unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.progress, 0.0);
    assert_eq!(retried.estimated_completion, None);
    assert_eq!(retried.retry_count, 1);

    assert_eq!(wait_terminal(&engine, id).await, JobStatus::Failed);
    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    for (n, pair) in starts.windows(2).enumerate() {
        let attempts_done = n as u32 + 1;
        let gap = pair[1].0 - pair[0].0;
        assert!(
            gap >= policy.delay_for_attempt(attempts_done),
            "attempt {} started {gap:?} after the previous one",
            attempts_done + 1
        );
    }
    // Every retry starts from zero progress with no estimate.
    for (_, progress, estimate) in &starts[1..] {
        assert_eq!(*progress, 0.0);
        assert_eq!(*estimate, None);
    }
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stream_flushes_on_size_and_on_timer() {
    let engine = engine_with(JobQueueConfig::default());
    let stream = StreamId::parse("risk-events").unwrap();
    engine
        .streams()
        .create_stream_processor(
            stream.clone(),
            StreamConfig::default()
                .with_buffer_size(3)
                .with_flush_interval(Duration::from_secs(5)),
        )
        .unwrap();
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    engine
        .streams()
        .start_stream_processing(&stream, move |_record: serde_json::Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();

    let mut acks = Vec::new();
    for n in 0..3 {
        acks.push(engine.streams().add_data_to_stream(&stream, json!({ "n": n })).await.unwrap());
    }
    assert!(acks[0].flushed.is_none() && acks[1].flushed.is_none());
    let size_flush = acks[2].flushed.clone().unwrap();
    assert_eq!(size_flush.records, 3);
    assert_eq!(size_flush.trigger, FlushTrigger::Size);
    assert_eq!(processed.load(Ordering::SeqCst), 3);

    engine.streams().add_data_to_stream(&stream, json!({ "n": 3 })).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5_100)).await;

    let state = engine.streams().get_stream_state(&stream).unwrap();
    assert_eq!(state.buffered, 0);
    let timer_flush = state.metrics.last_flush.unwrap();
    assert_eq!(timer_flush.trigger, FlushTrigger::Timer);
    assert_eq!(timer_flush.records, 1);
    assert_eq!(processed.load(Ordering::SeqCst), 4);

    engine.shutdown().await;
}

#[tokio::test]
async fn failing_job_exhausts_retries_and_raises_alerts() {
    let policy = RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5));
    let engine = engine_with(JobQueueConfig::default().with_retry_policy(policy));
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    engine
        .queue()
        .register("risk_assessment", move |_ctx: JobContext| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<serde_json::Value, _>(HandlerError::transient("scoring service unavailable"))
            }
        })
        .unwrap();

    let mut events = engine.subscribe_status_changes();
    let id = engine.queue().submit("risk_assessment", json!({ "entity": "acme" })).unwrap();
    let transitions = transitions_of(&mut events, id).await;

    assert_eq!(
        transitions,
        vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Failed,
        ]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let snapshot = engine.queue().get_job_status(id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.attempts, 3);
    let history = engine.status().get_history_record(id).unwrap();
    assert_eq!(history.record.retry_count, 2);

    // The alert monitor drains pending status events when it stops.
    engine.shutdown().await;
    let alerts = engine.alerts().get_active_alerts();
    assert!(
        alerts
            .iter()
            .any(|a| a.alert_type == AlertType::JobFailure && a.job_id == Some(id))
    );
    let errors = engine.errors().error_statistics();
    assert_eq!(errors.total, 3);
    assert_eq!(errors.terminal_failures, 1);
}

#[tokio::test]
async fn pending_job_can_be_cancelled() {
    let engine = engine_with(JobQueueConfig::default().with_concurrency(1));
    let release = Arc::new(tokio::sync::Notify::new());
    let gate = release.clone();
    engine
        .queue()
        .register("sanctions_screening", move |_ctx: JobContext| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, HandlerError>(json!("clear"))
            }
        })
        .unwrap();

    let mut events = engine.subscribe_status_changes();
    let blocker = engine.queue().submit("sanctions_screening", json!({})).unwrap();
    let waiting = engine.queue().submit("sanctions_screening", json!({})).unwrap();
    // The single worker is busy once the first job reports running.
    wait_running(&mut events, blocker).await;

    let cancelled = engine
        .queue()
        .cancel(waiting, Some("duplicate request".to_string()))
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("duplicate request"));

    let again = engine.queue().cancel(waiting, None).unwrap_err();
    assert!(matches!(again, EngineError::InvalidStateTransition { .. }));

    release.notify_one();
    assert_eq!(wait_terminal(&engine, blocker).await, JobStatus::Completed);
    assert_eq!(
        engine.queue().get_job_status(waiting).unwrap().status,
        JobStatus::Cancelled
    );
    engine.shutdown().await;
}

async fn wait_running(events: &mut Subscription<JobStatusChanged>, job_id: JobId) {
    while let Some(event) = events.recv().await {
        if event.job_id == job_id && event.to == JobStatus::Running {
            return;
        }
    }
    panic!("status stream ended before {job_id} started");
}

#[tokio::test]
async fn batch_runs_through_the_engine() {
    let engine = engine_with(JobQueueConfig::default());
    let records: Vec<serde_json::Value> = (0..25).map(|n| json!({ "row": n })).collect();
    let source = VecSource::new(records);
    let job = engine
        .batches()
        .create_batch_job(BatchJobSpec::new("nightly-rescore").with_chunk_size(10))
        .unwrap();

    let handler = |_record: serde_json::Value| async { Ok::<_, HandlerError>(()) };
    let done = engine
        .batches()
        .start_batch_processing(job.id, &source, &handler)
        .await
        .unwrap();

    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!(done.records_processed, 25);
    assert!(engine.monitor().get_operation_metrics("batch.chunk").is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_new_work_and_is_idempotent() {
    let engine = engine_with(JobQueueConfig::default());
    engine
        .queue()
        .register("kyc_refresh", |_ctx: JobContext| async { Ok::<_, HandlerError>(json!(null)) })
        .unwrap();

    engine.shutdown().await;
    engine.shutdown().await;

    let err = engine.queue().submit("kyc_refresh", json!({})).unwrap_err();
    assert!(matches!(err, EngineError::Backpressure(_)));
}

#[tokio::test]
async fn cleanup_forgets_finished_jobs_and_resolved_alerts() {
    let engine = engine_with(JobQueueConfig::default());
    engine
        .queue()
        .register("kyc_refresh", |_ctx: JobContext| async { Ok::<_, HandlerError>(json!(null)) })
        .unwrap();
    let id = engine.queue().submit("kyc_refresh", json!({})).unwrap();
    assert_eq!(wait_terminal(&engine, id).await, JobStatus::Completed);

    let alert = engine
        .alerts()
        .raise(AlertType::HighMemory, Severity::High, "memory", None, "memory at 93%")
        .unwrap();
    engine.alerts().resolve_alert(alert.id).unwrap();

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
    let report = engine.cleanup(cutoff).unwrap();
    assert_eq!(report, CleanupReport { jobs: 1, alerts: 1 });
    assert!(engine.queue().get_job_status(id).unwrap_err().is_not_found());
    assert!(engine.status().get_history_record(id).unwrap_err().is_not_found());
    assert!(engine.alerts().get_alert(alert.id).unwrap_err().is_not_found());
    engine.shutdown().await;
}
