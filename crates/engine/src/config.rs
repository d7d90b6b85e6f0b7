//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use riskwatch_alerts::AlertThresholds;
use riskwatch_core::{EngineError, EngineResult};
use riskwatch_jobs::{BatchConfig, JobQueueConfig};
use riskwatch_observability::MonitorConfig;
use riskwatch_streams::StreamConfig;

const ENV_PREFIX: &str = "RISKWATCH_";

/// Everything [`crate::Engine::start`] needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub queue: JobQueueConfig,
    pub monitor: MonitorConfig,
    pub batch: BatchConfig,
    /// Used for streams created through [`crate::Engine::create_stream`].
    pub stream: StreamConfig,
    pub alerts: AlertThresholds,
    /// Period of host resource sampling; `None` disables the sampler.
    pub resource_sample_interval: Option<Duration>,
    /// Per-subscriber buffer of the job status event bus.
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: JobQueueConfig::default(),
            monitor: MonitorConfig::default(),
            batch: BatchConfig::default(),
            stream: StreamConfig::default(),
            alerts: AlertThresholds::default(),
            resource_sample_interval: Some(Duration::from_secs(30)),
            event_bus_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `RISKWATCH_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `RISKWATCH_*` key. Unset keys keep their default; unparsable values are
    /// errors naming the key.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = parse::<usize>(&var, "CONCURRENCY")? {
            config.queue.concurrency = v;
        }
        if let Some(v) = parse::<usize>(&var, "QUEUE_CAPACITY")? {
            config.queue.capacity = v;
        }
        if let Some(v) = parse::<u32>(&var, "MAX_RETRIES")? {
            config.queue.retry_policy.max_retries = v;
        }
        if let Some(v) = parse::<u64>(&var, "BACKOFF_BASE_MS")? {
            config.queue.retry_policy.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&var, "BACKOFF_MAX_MS")? {
            config.queue.retry_policy.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<usize>(&var, "METRICS_WINDOW")? {
            config.monitor = config.monitor.with_window_size(v);
        }
        if let Some(v) = parse::<u64>(&var, "RESOURCE_SAMPLE_SECS")? {
            config.resource_sample_interval = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse::<f32>(&var, "CPU_ALERT_PERCENT")? {
            let critical = config.alerts.cpu_critical_percent.max(v);
            config.alerts = config.alerts.with_cpu(v, critical);
        }
        if let Some(v) = parse::<f32>(&var, "MEMORY_ALERT_PERCENT")? {
            let critical = config.alerts.memory_critical_percent.max(v);
            config.alerts = config.alerts.with_memory(v, critical);
        }
        if let Some(v) = parse::<f64>(&var, "BATCH_ERROR_RATE")? {
            config.batch.error_rate_threshold = v;
        }

        config
            .validate()
            .context("invalid engine configuration")?;
        Ok(config)
    }

    pub fn with_queue(mut self, queue: JobQueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_alerts(mut self, alerts: AlertThresholds) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_resource_sample_interval(mut self, interval: Option<Duration>) -> Self {
        self.resource_sample_interval = interval;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.queue.validate()?;
        self.stream.validate()?;
        self.alerts.validate()?;
        if !(0.0..=1.0).contains(&self.batch.error_rate_threshold) {
            return Err(EngineError::validation(
                "batch error rate threshold must be between 0 and 1",
            ));
        }
        if self.batch.default_chunk_size == 0 {
            return Err(EngineError::validation("batch chunk size must be at least 1"));
        }
        if self.event_bus_capacity == 0 {
            return Err(EngineError::validation("event bus capacity must be at least 1"));
        }
        if self.resource_sample_interval.is_some_and(|i| i.is_zero()) {
            return Err(EngineError::validation("resource sample interval must be positive"));
        }
        Ok(())
    }
}

fn parse<T>(var: &dyn Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = var(name) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow!("{e}"))
        .with_context(|| format!("{ENV_PREFIX}{name} has an invalid value {raw:?}"))?;
    Ok(Some(value))
}
