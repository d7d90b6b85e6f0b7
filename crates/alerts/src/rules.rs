//! Alert rule table.

use serde::{Deserialize, Serialize};

use riskwatch_core::{EngineError, EngineResult, Severity};

/// Kind of condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// A single job finalized as failed.
    JobFailure,
    /// Several jobs of one type failed in a row.
    ConsecutiveFailures,
    HighCpu,
    HighMemory,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::JobFailure => "job_failure",
            AlertType::ConsecutiveFailures => "consecutive_failures",
            AlertType::HighCpu => "high_cpu",
            AlertType::HighMemory => "high_memory",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds feeding the rule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Failures in a row (per job type) that raise a `high` alert; twice as
    /// many raise `critical`.
    pub consecutive_failure_threshold: u32,
    pub cpu_warning_percent: f32,
    pub cpu_critical_percent: f32,
    pub memory_warning_percent: f32,
    pub memory_critical_percent: f32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 3,
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 95.0,
            memory_warning_percent: 85.0,
            memory_critical_percent: 95.0,
        }
    }
}

impl AlertThresholds {
    pub fn with_consecutive_failure_threshold(mut self, threshold: u32) -> Self {
        self.consecutive_failure_threshold = threshold;
        self
    }

    pub fn with_cpu(mut self, warning: f32, critical: f32) -> Self {
        self.cpu_warning_percent = warning;
        self.cpu_critical_percent = critical;
        self
    }

    pub fn with_memory(mut self, warning: f32, critical: f32) -> Self {
        self.memory_warning_percent = warning;
        self.memory_critical_percent = critical;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.consecutive_failure_threshold == 0 {
            return Err(EngineError::validation(
                "consecutive failure threshold must be at least 1",
            ));
        }
        for (name, warning, critical) in [
            ("cpu", self.cpu_warning_percent, self.cpu_critical_percent),
            ("memory", self.memory_warning_percent, self.memory_critical_percent),
        ] {
            if !(0.0..=100.0).contains(&warning) || !(0.0..=100.0).contains(&critical) {
                return Err(EngineError::validation(format!(
                    "{name} thresholds must be percentages"
                )));
            }
            if warning > critical {
                return Err(EngineError::validation(format!(
                    "{name} warning threshold exceeds its critical threshold"
                )));
            }
        }
        Ok(())
    }

    /// Severity of an alert for one terminal failure.
    pub fn job_failure_severity(&self, error_severity: Option<Severity>) -> Severity {
        match error_severity {
            Some(s) if s >= Severity::High => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// Severity for `streak` failures in a row, if any alert is due.
    pub fn streak_severity(&self, streak: u32) -> Option<Severity> {
        let threshold = self.consecutive_failure_threshold.max(1);
        if streak >= threshold.saturating_mul(2) {
            Some(Severity::Critical)
        } else if streak >= threshold {
            Some(Severity::High)
        } else {
            None
        }
    }

    pub fn cpu_severity(&self, percent: f32) -> Option<Severity> {
        band(percent, self.cpu_warning_percent, self.cpu_critical_percent)
    }

    pub fn memory_severity(&self, percent: f32) -> Option<Severity> {
        band(percent, self.memory_warning_percent, self.memory_critical_percent)
    }
}

fn band(value: f32, warning: f32, critical: f32) -> Option<Severity> {
    if value > critical {
        Some(Severity::Critical)
    } else if value > warning {
        Some(Severity::High)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_severity_follows_error_severity() {
        let t = AlertThresholds::default();
        assert_eq!(t.job_failure_severity(None), Severity::Low);
        assert_eq!(t.job_failure_severity(Some(Severity::Medium)), Severity::Low);
        assert_eq!(t.job_failure_severity(Some(Severity::High)), Severity::Medium);
    }

    #[test]
    fn streaks_escalate_at_threshold_and_twice_threshold() {
        let t = AlertThresholds::default().with_consecutive_failure_threshold(3);
        assert_eq!(t.streak_severity(2), None);
        assert_eq!(t.streak_severity(3), Some(Severity::High));
        assert_eq!(t.streak_severity(5), Some(Severity::High));
        assert_eq!(t.streak_severity(6), Some(Severity::Critical));
    }

    #[test]
    fn resource_bands() {
        let t = AlertThresholds::default().with_cpu(80.0, 95.0);
        assert_eq!(t.cpu_severity(50.0), None);
        assert_eq!(t.cpu_severity(80.0), None);
        assert_eq!(t.cpu_severity(81.0), Some(Severity::High));
        assert_eq!(t.cpu_severity(99.0), Some(Severity::Critical));
    }

    #[test]
    fn inverted_thresholds_are_invalid() {
        assert!(AlertThresholds::default().validate().is_ok());
        assert!(AlertThresholds::default().with_memory(90.0, 50.0).validate().is_err());
        assert!(
            AlertThresholds::default()
                .with_consecutive_failure_threshold(0)
                .validate()
                .is_err()
        );
    }
}
