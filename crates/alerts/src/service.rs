//! Alert lifecycle: raise, deduplicate, escalate, resolve, expire.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use riskwatch_core::{AlertId, EngineError, EngineResult, JobId, Page, Pagination, Severity};
use riskwatch_events::EventBus;
use riskwatch_jobs::{JobError, JobType};
use riskwatch_observability::SystemMetrics;

use crate::rules::{AlertThresholds, AlertType};

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Deduplication key within the alert type (job id, job type, resource).
    pub key: String,
    pub job_id: Option<JobId>,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Published on every alert change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "alert", rename_all = "snake_case")]
pub enum AlertEvent {
    Raised(Alert),
    Escalated(Alert),
    Resolved(Alert),
}

/// History filter; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub active: Option<bool>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.alert_type.is_none_or(|t| t == alert.alert_type)
            && self.severity.is_none_or(|s| s == alert.severity)
            && self.active.is_none_or(|a| a == alert.is_active)
    }
}

/// Alert counts and resolution times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStatistics {
    pub total: u64,
    pub active: u64,
    pub resolved: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub mean_time_to_resolution_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct AlertBook {
    alerts: HashMap<AlertId, Alert>,
    active: HashMap<(AlertType, String), AlertId>,
    streaks: HashMap<JobType, u32>,
}

/// Raises and resolves alerts.
pub struct AlertService {
    thresholds: AlertThresholds,
    book: Mutex<AlertBook>,
    bus: Option<Arc<dyn EventBus<AlertEvent>>>,
}

impl std::fmt::Debug for AlertService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertService")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl Default for AlertService {
    fn default() -> Self {
        Self::new(AlertThresholds::default())
    }
}

impl AlertService {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            book: Mutex::new(AlertBook::default()),
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus<AlertEvent>>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    fn book(&self) -> MutexGuard<'_, AlertBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, events: Vec<AlertEvent>) {
        let Some(bus) = &self.bus else { return };
        for event in events {
            if let Err(e) = bus.publish(event) {
                warn!(error = %e, "failed to publish alert event");
            }
        }
    }

    /// Raise an alert unless one is already active for `(alert_type, key)`.
    ///
    /// An active duplicate with a lower severity is escalated in place.
    /// Returns the new or escalated alert, or `None` when suppressed.
    pub fn raise(
        &self,
        alert_type: AlertType,
        severity: Severity,
        key: impl Into<String>,
        job_id: Option<JobId>,
        message: impl Into<String>,
    ) -> Option<Alert> {
        let event = {
            let mut book = self.book();
            raise_in(&mut book, alert_type, severity, key.into(), job_id, message.into())
        }?;
        let alert = match &event {
            AlertEvent::Raised(a) | AlertEvent::Escalated(a) | AlertEvent::Resolved(a) => a.clone(),
        };
        self.publish(vec![event]);
        Some(alert)
    }

    /// Feed a terminal job failure through the rule table.
    pub fn record_job_failure(&self, job_type: &JobType, job_id: JobId, error: Option<&JobError>) -> Vec<Alert> {
        let mut events = Vec::new();
        {
            let mut book = self.book();
            let streak = {
                let streak = book.streaks.entry(job_type.clone()).or_default();
                *streak += 1;
                *streak
            };

            let severity = self.thresholds.job_failure_severity(error.map(|e| e.severity));
            let reason = error.map(|e| e.message.as_str()).unwrap_or("unknown error");
            events.extend(raise_in(
                &mut book,
                AlertType::JobFailure,
                severity,
                job_id.to_string(),
                Some(job_id),
                format!("{job_type} job {job_id} failed: {reason}"),
            ));

            if let Some(severity) = self.thresholds.streak_severity(streak) {
                events.extend(raise_in(
                    &mut book,
                    AlertType::ConsecutiveFailures,
                    severity,
                    job_type.to_string(),
                    Some(job_id),
                    format!("{streak} consecutive {job_type} job failures"),
                ));
            }
        }
        self.finish(events)
    }

    /// A success resets the failure streak of its type and resolves its streak alert.
    pub fn record_job_success(&self, job_type: &JobType) -> Vec<Alert> {
        let events = {
            let mut book = self.book();
            book.streaks.remove(job_type);
            resolve_key_in(&mut book, AlertType::ConsecutiveFailures, job_type.as_str())
                .into_iter()
                .collect()
        };
        self.finish(events)
    }

    /// Compare a host snapshot against the resource thresholds.
    pub fn record_resource_sample(&self, metrics: &SystemMetrics) -> Vec<Alert> {
        let cpu = metrics.cpu_percent;
        let memory = metrics.memory_percent() as f32;
        let checks = [
            (AlertType::HighCpu, "cpu", cpu, self.thresholds.cpu_severity(cpu)),
            (AlertType::HighMemory, "memory", memory, self.thresholds.memory_severity(memory)),
        ];

        let mut events = Vec::new();
        {
            let mut book = self.book();
            for (alert_type, key, value, severity) in checks {
                match severity {
                    Some(severity) => events.extend(raise_in(
                        &mut book,
                        alert_type,
                        severity,
                        key.to_string(),
                        None,
                        format!("{key} usage at {value:.1}%"),
                    )),
                    None => events.extend(resolve_key_in(&mut book, alert_type, key)),
                }
            }
        }
        self.finish(events)
    }

    fn finish(&self, events: Vec<AlertEvent>) -> Vec<Alert> {
        let alerts = events
            .iter()
            .map(|event| match event {
                AlertEvent::Raised(a) | AlertEvent::Escalated(a) | AlertEvent::Resolved(a) => a.clone(),
            })
            .collect();
        self.publish(events);
        alerts
    }

    /// Resolve an alert. Resolving twice is a no-op.
    pub fn resolve_alert(&self, id: AlertId) -> EngineResult<Alert> {
        let alert = {
            let mut book = self.book();
            let alert = book
                .alerts
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("alert", id))?;
            if !alert.is_active {
                return Ok(alert.clone());
            }
            resolve(alert);
            let alert = alert.clone();
            book.active.remove(&(alert.alert_type, alert.key.clone()));
            alert
        };
        info!(alert_id = %id, alert_type = %alert.alert_type, "alert resolved");
        self.publish(vec![AlertEvent::Resolved(alert.clone())]);
        Ok(alert)
    }

    pub fn get_alert(&self, id: AlertId) -> EngineResult<Alert> {
        self.book()
            .alerts
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("alert", id))
    }

    /// Active alerts, most severe first, then oldest first.
    pub fn get_active_alerts(&self) -> Vec<Alert> {
        let mut active: Vec<Alert> = self
            .book()
            .alerts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.triggered_at.cmp(&b.triggered_at))
                .then(a.id.cmp(&b.id))
        });
        active
    }

    /// All alerts matching `filter`, most recent first.
    pub fn get_alert_history(&self, filter: &AlertFilter, pagination: Pagination) -> Page<Alert> {
        let mut alerts: Vec<Alert> = self
            .book()
            .alerts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(b.id.cmp(&a.id)));
        Page::slice(alerts, pagination)
    }

    pub fn get_alert_statistics(&self) -> AlertStatistics {
        let book = self.book();
        let mut stats = AlertStatistics {
            total: book.alerts.len() as u64,
            ..Default::default()
        };
        let mut resolution_ms = Vec::new();
        for alert in book.alerts.values() {
            if alert.is_active {
                stats.active += 1;
            } else {
                stats.resolved += 1;
            }
            *stats.by_severity.entry(alert.severity.to_string()).or_default() += 1;
            *stats.by_type.entry(alert.alert_type.to_string()).or_default() += 1;
            if let Some(resolved_at) = alert.resolved_at {
                resolution_ms.push((resolved_at - alert.triggered_at).num_milliseconds().max(0) as f64);
            }
        }
        if !resolution_ms.is_empty() {
            stats.mean_time_to_resolution_ms =
                Some(resolution_ms.iter().sum::<f64>() / resolution_ms.len() as f64);
        }
        stats
    }

    /// Drop resolved alerts that were resolved before `older_than`. Active
    /// alerts are kept whatever their age. Returns how many were removed.
    pub fn cleanup_resolved(&self, older_than: DateTime<Utc>) -> usize {
        let mut book = self.book();
        let before = book.alerts.len();
        book.alerts
            .retain(|_, alert| alert.is_active || alert.resolved_at.is_none_or(|at| at >= older_than));
        let removed = before - book.alerts.len();
        if removed > 0 {
            info!(removed, cutoff = %older_than, "resolved alerts cleaned up");
        }
        removed
    }

    /// Current failure streak of a job type.
    pub fn failure_streak(&self, job_type: &JobType) -> u32 {
        self.book().streaks.get(job_type).copied().unwrap_or(0)
    }
}

fn resolve(alert: &mut Alert) {
    alert.is_active = false;
    alert.resolved_at = Some(Utc::now());
}

fn raise_in(
    book: &mut AlertBook,
    alert_type: AlertType,
    severity: Severity,
    key: String,
    job_id: Option<JobId>,
    message: String,
) -> Option<AlertEvent> {
    if let Some(existing_id) = book.active.get(&(alert_type, key.clone())).copied() {
        let existing = book.alerts.get_mut(&existing_id)?;
        if severity <= existing.severity {
            return None;
        }
        existing.severity = severity;
        existing.message = message;
        existing.job_id = job_id.or(existing.job_id);
        warn!(
            alert_id = %existing.id,
            alert_type = %alert_type,
            severity = %severity,
            message = %existing.message,
            "alert escalated"
        );
        return Some(AlertEvent::Escalated(existing.clone()));
    }

    let alert = Alert {
        id: AlertId::new(),
        alert_type,
        severity,
        key: key.clone(),
        job_id,
        message,
        triggered_at: Utc::now(),
        resolved_at: None,
        is_active: true,
    };
    warn!(
        alert_id = %alert.id,
        alert_type = %alert_type,
        severity = %severity,
        message = %alert.message,
        "alert raised"
    );
    book.active.insert((alert_type, key), alert.id);
    book.alerts.insert(alert.id, alert.clone());
    Some(AlertEvent::Raised(alert))
}

fn resolve_key_in(book: &mut AlertBook, alert_type: AlertType, key: &str) -> Option<AlertEvent> {
    let id = book.active.remove(&(alert_type, key.to_string()))?;
    let alert = book.alerts.get_mut(&id)?;
    resolve(alert);
    info!(alert_id = %id, alert_type = %alert_type, key, "alert auto-resolved");
    Some(AlertEvent::Resolved(alert.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskwatch_core::ErrorKind;
    use riskwatch_events::InMemoryEventBus;

    fn job_type(tag: &str) -> JobType {
        JobType::new(tag).unwrap()
    }

    fn error(severity: Severity) -> JobError {
        JobError {
            kind: ErrorKind::Permanent,
            severity,
            message: "scorer rejected payload".to_string(),
        }
    }

    fn sample(cpu: f32, used: u64) -> SystemMetrics {
        SystemMetrics {
            cpu_percent: cpu,
            process_cpu_percent: None,
            cpu_count: 8,
            memory_used_bytes: used,
            memory_total_bytes: 100,
            process_memory_bytes: None,
            uptime_secs: 1,
            host_uptime_secs: 1,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn isolated_failure_raises_low_or_medium() {
        let service = AlertService::default();
        let low = service.record_job_failure(&job_type("risk"), JobId::new(), None);
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].severity, Severity::Low);
        assert_eq!(low[0].alert_type, AlertType::JobFailure);

        let medium = service.record_job_failure(&job_type("bias"), JobId::new(), Some(&error(Severity::High)));
        assert_eq!(medium[0].severity, Severity::Medium);
    }

    #[test]
    fn consecutive_failures_escalate_then_resolve_on_success() {
        let service = AlertService::new(AlertThresholds::default().with_consecutive_failure_threshold(2));
        let risk = job_type("risk");

        service.record_job_failure(&risk, JobId::new(), None);
        let second = service.record_job_failure(&risk, JobId::new(), None);
        let streak = second
            .iter()
            .find(|a| a.alert_type == AlertType::ConsecutiveFailures)
            .unwrap();
        assert_eq!(streak.severity, Severity::High);

        service.record_job_failure(&risk, JobId::new(), None);
        let fourth = service.record_job_failure(&risk, JobId::new(), None);
        let escalated = fourth
            .iter()
            .find(|a| a.alert_type == AlertType::ConsecutiveFailures)
            .unwrap();
        assert_eq!(escalated.id, streak.id);
        assert_eq!(escalated.severity, Severity::Critical);

        let resolved = service.record_job_success(&risk);
        assert_eq!(resolved.len(), 1);
        assert!(!resolved[0].is_active);
        assert_eq!(service.failure_streak(&risk), 0);
    }

    #[test]
    fn duplicates_are_suppressed_while_active() {
        let service = AlertService::default();
        let first = service.raise(AlertType::HighCpu, Severity::High, "cpu", None, "hot");
        assert!(first.is_some());
        assert!(service.raise(AlertType::HighCpu, Severity::High, "cpu", None, "still hot").is_none());
        assert_eq!(service.get_active_alerts().len(), 1);

        service.resolve_alert(first.unwrap().id).unwrap();
        assert!(service.raise(AlertType::HighCpu, Severity::High, "cpu", None, "hot again").is_some());
    }

    #[test]
    fn resolve_is_idempotent_and_unknown_is_not_found() {
        let service = AlertService::default();
        let alert = service
            .raise(AlertType::HighMemory, Severity::High, "memory", None, "full")
            .unwrap();

        let once = service.resolve_alert(alert.id).unwrap();
        let twice = service.resolve_alert(alert.id).unwrap();
        assert_eq!(once, twice);
        assert!(!twice.is_active);
        assert!(service.resolve_alert(AlertId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn resource_samples_raise_and_auto_resolve() {
        let service = AlertService::new(AlertThresholds::default().with_cpu(80.0, 95.0).with_memory(85.0, 95.0));

        let raised = service.record_resource_sample(&sample(97.0, 90));
        let types: Vec<_> = raised.iter().map(|a| (a.alert_type, a.severity)).collect();
        assert_eq!(
            types,
            vec![(AlertType::HighCpu, Severity::Critical), (AlertType::HighMemory, Severity::High)]
        );

        let calm = service.record_resource_sample(&sample(10.0, 20));
        assert_eq!(calm.len(), 2);
        assert!(service.get_active_alerts().is_empty());
    }

    #[test]
    fn statistics_and_history() {
        let service = AlertService::default();
        let a = service.raise(AlertType::HighCpu, Severity::High, "cpu", None, "hot").unwrap();
        service.raise(AlertType::JobFailure, Severity::Low, "job-1", None, "failed");
        service.resolve_alert(a.id).unwrap();

        let stats = service.get_alert_statistics();
        assert_eq!((stats.total, stats.active, stats.resolved), (2, 1, 1));
        assert_eq!(stats.by_severity["high"], 1);
        assert_eq!(stats.by_type["job_failure"], 1);
        assert!(stats.mean_time_to_resolution_ms.is_some());

        let active_only = AlertFilter {
            active: Some(true),
            ..Default::default()
        };
        let page = service.get_alert_history(&active_only, Pagination::default());
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].alert_type, AlertType::JobFailure);
    }

    #[test]
    fn cleanup_drops_only_old_resolved_alerts() {
        let service = AlertService::default();
        let risk = job_type("risk");
        let first = service.record_job_failure(&risk, JobId::new(), None).remove(0);
        let second = service.record_job_failure(&risk, JobId::new(), None).remove(0);
        let cpu = service.raise(AlertType::HighCpu, Severity::High, "cpu", None, "hot").unwrap();
        service.resolve_alert(first.id).unwrap();
        service.resolve_alert(cpu.id).unwrap();

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(service.cleanup_resolved(long_ago), 0);
        assert_eq!(service.get_alert_statistics().total, 3);

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(service.cleanup_resolved(cutoff), 2);
        assert!(service.get_alert(first.id).unwrap_err().is_not_found());
        assert!(service.get_alert(cpu.id).unwrap_err().is_not_found());
        assert!(service.get_alert(second.id).unwrap().is_active);
        assert_eq!(service.get_alert_statistics().total, 1);
    }

    #[tokio::test]
    async fn changes_are_published() {
        let bus: Arc<InMemoryEventBus<AlertEvent>> = Arc::new(InMemoryEventBus::new());
        let mut events = bus.subscribe();
        let service = AlertService::default().with_event_bus(bus.clone());

        let alert = service.raise(AlertType::HighCpu, Severity::High, "cpu", None, "hot").unwrap();
        service.resolve_alert(alert.id).unwrap();

        assert!(matches!(events.recv().await, Some(AlertEvent::Raised(_))));
        assert!(matches!(events.recv().await, Some(AlertEvent::Resolved(_))));
    }
}
