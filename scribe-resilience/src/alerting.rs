//! Alert rules over service health metrics.
//!
//! Rules are plain threshold comparisons against a service's derived metric
//! fields, owned and mutated by the application (CRUD only, no side effects
//! beyond future evaluations). Firing is debounced per rule: a rule that
//! matched less than the debounce window ago is suppressed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::health::HealthMetric;

/// Alert severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Immediate action required (pages on-call)
    Critical,
    /// Investigate soon but not an emergency
    Warning,
    /// Informational, may indicate degradation
    Info,
    /// For visibility, no action typically needed
    Notice,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Info => "info",
            AlertSeverity::Notice => "notice",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which derived metric field a rule watches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    ErrorRate,
    AvgResponseTimeMs,
}

impl AlertMetric {
    pub fn value_of(&self, metric: &HealthMetric) -> f64 {
        match self {
            AlertMetric::ErrorRate => metric.error_rate,
            AlertMetric::AvgResponseTimeMs => metric.avg_response_time_ms,
        }
    }
}

/// Comparison operator for rule thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertOperator {
    Gt,
    Lt,
    Eq,
}

impl AlertOperator {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertOperator::Gt => value > threshold,
            AlertOperator::Lt => value < threshold,
            AlertOperator::Eq => (value - threshold).abs() < 1e-9,
        }
    }
}

/// A single threshold rule against one service's metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub service: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub operator: AlertOperator,
    pub severity: AlertSeverity,
    pub enabled: bool,
}

/// A fired alert, handed to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub rule_id: String,
    pub service: String,
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub fired_at: DateTime<Utc>,
}

/// Sink for fired alerts. The default logs through `tracing`; the owning
/// application can plug in pager/webhook delivery instead.
pub trait AlertDispatcher: Send + Sync {
    fn dispatch(&self, event: &AlertEvent);
}

/// Dispatcher that routes alerts to the log, level chosen by severity.
#[derive(Debug, Default)]
pub struct TracingDispatcher;

impl AlertDispatcher for TracingDispatcher {
    fn dispatch(&self, event: &AlertEvent) {
        match event.severity {
            AlertSeverity::Critical => error!(
                "ALERT [{}] {} {}={:.3} breached threshold {:.3}",
                event.severity, event.service, event.metric_name(), event.value, event.threshold
            ),
            AlertSeverity::Warning => warn!(
                "ALERT [{}] {} {}={:.3} breached threshold {:.3}",
                event.severity, event.service, event.metric_name(), event.value, event.threshold
            ),
            AlertSeverity::Info | AlertSeverity::Notice => info!(
                "ALERT [{}] {} {}={:.3} breached threshold {:.3}",
                event.severity, event.service, event.metric_name(), event.value, event.threshold
            ),
        }
    }
}

impl AlertEvent {
    fn metric_name(&self) -> &'static str {
        match self.metric {
            AlertMetric::ErrorRate => "error_rate",
            AlertMetric::AvgResponseTimeMs => "avg_response_time_ms",
        }
    }
}

/// Owns the mutable rule set and the per-rule firing history.
pub struct AlertManager {
    rules: DashMap<String, AlertRule>,
    /// Last firing per rule id, for debounce only
    history: DashMap<String, Instant>,
    debounce: Duration,
    dispatcher: Arc<dyn AlertDispatcher>,
}

impl AlertManager {
    pub fn new(debounce: Duration) -> Self {
        Self::with_dispatcher(debounce, Arc::new(TracingDispatcher))
    }

    pub fn with_dispatcher(debounce: Duration, dispatcher: Arc<dyn AlertDispatcher>) -> Self {
        Self {
            rules: DashMap::new(),
            history: DashMap::new(),
            debounce,
            dispatcher,
        }
    }

    /// Insert or replace a rule by id.
    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    /// Returns whether a rule with that id existed.
    pub fn remove_rule(&self, id: &str) -> bool {
        self.rules.remove(id).is_some()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.rules.get_mut(id) {
            Some(mut rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn update_threshold(&self, id: &str, threshold: f64) -> bool {
        match self.rules.get_mut(id) {
            Some(mut rule) => {
                rule.threshold = threshold;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all rules, ordered by id.
    pub fn rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<_> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Evaluate every enabled rule for the metric's service and dispatch the
    /// ones that match and are not inside their debounce window.
    pub fn evaluate(&self, metric: &HealthMetric) {
        let matching: Vec<AlertRule> = self
            .rules
            .iter()
            .filter(|r| r.enabled && r.service == metric.service)
            .map(|r| r.value().clone())
            .collect();

        for rule in matching {
            let value = rule.metric.value_of(metric);
            if !rule.operator.compare(value, rule.threshold) {
                continue;
            }

            let fired_recently = self
                .history
                .get(&rule.id)
                .map(|stamp| stamp.elapsed() < self.debounce)
                .unwrap_or(false);
            if fired_recently {
                debug!("Alert {} suppressed by debounce window", rule.id);
                continue;
            }
            self.history.insert(rule.id.clone(), Instant::now());

            let event = AlertEvent {
                rule_id: rule.id.clone(),
                service: rule.service.clone(),
                metric: rule.metric,
                value,
                threshold: rule.threshold,
                severity: rule.severity,
                fired_at: Utc::now(),
            };
            self.dispatcher.dispatch(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingDispatcher {
        events: Mutex<Vec<AlertEvent>>,
    }

    impl AlertDispatcher for CapturingDispatcher {
        fn dispatch(&self, event: &AlertEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn rule(id: &str, service: &str, threshold: f64) -> AlertRule {
        AlertRule {
            id: id.to_string(),
            service: service.to_string(),
            metric: AlertMetric::ErrorRate,
            threshold,
            operator: AlertOperator::Gt,
            severity: AlertSeverity::Warning,
            enabled: true,
        }
    }

    fn metric(service: &str, error_rate: f64, avg_ms: f64) -> HealthMetric {
        HealthMetric {
            service: service.to_string(),
            status: HealthStatus::Healthy,
            error_rate,
            avg_response_time_ms: avg_ms,
            last_check: Utc::now(),
        }
    }

    fn manager(debounce_ms: u64) -> (AlertManager, Arc<CapturingDispatcher>) {
        let dispatcher = Arc::new(CapturingDispatcher::default());
        let manager =
            AlertManager::with_dispatcher(Duration::from_millis(debounce_ms), dispatcher.clone());
        (manager, dispatcher)
    }

    #[test]
    fn test_operator_comparisons() {
        assert!(AlertOperator::Gt.compare(0.3, 0.2));
        assert!(!AlertOperator::Gt.compare(0.2, 0.2));
        assert!(AlertOperator::Lt.compare(0.1, 0.2));
        assert!(AlertOperator::Eq.compare(0.2, 0.2));
        assert!(!AlertOperator::Eq.compare(0.2000001, 0.2));
    }

    #[test]
    fn test_rule_crud() {
        let (manager, _) = manager(1000);
        manager.add_rule(rule("r1", "db", 0.2));
        manager.add_rule(rule("r2", "db", 0.5));
        assert_eq!(manager.rules().len(), 2);

        assert!(manager.update_threshold("r1", 0.3));
        assert_eq!(manager.rules()[0].threshold, 0.3);

        assert!(manager.set_enabled("r2", false));
        assert!(!manager.rules()[1].enabled);

        assert!(manager.remove_rule("r1"));
        assert!(!manager.remove_rule("r1"));
        assert_eq!(manager.rules().len(), 1);
    }

    #[test]
    fn test_breach_dispatches_event() {
        let (manager, dispatcher) = manager(1000);
        manager.add_rule(rule("r1", "db", 0.2));

        manager.evaluate(&metric("db", 0.5, 10.0));

        let events = dispatcher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, "r1");
        assert_eq!(events[0].value, 0.5);
    }

    #[test]
    fn test_no_dispatch_below_threshold() {
        let (manager, dispatcher) = manager(1000);
        manager.add_rule(rule("r1", "db", 0.2));
        manager.evaluate(&metric("db", 0.1, 10.0));
        assert!(dispatcher.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let (manager, dispatcher) = manager(1000);
        let mut r = rule("r1", "db", 0.2);
        r.enabled = false;
        manager.add_rule(r);
        manager.evaluate(&metric("db", 0.9, 10.0));
        assert!(dispatcher.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_service_mismatch_never_fires() {
        let (manager, dispatcher) = manager(1000);
        manager.add_rule(rule("r1", "db", 0.2));
        manager.evaluate(&metric("cache", 0.9, 10.0));
        assert!(dispatcher.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_debounce_suppresses_repeat_firing() {
        let (manager, dispatcher) = manager(10_000);
        manager.add_rule(rule("r1", "db", 0.2));

        manager.evaluate(&metric("db", 0.5, 10.0));
        manager.evaluate(&metric("db", 0.6, 10.0));

        assert_eq!(dispatcher.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_debounce_expiry_allows_refiring() {
        let (manager, dispatcher) = manager(20);
        manager.add_rule(rule("r1", "db", 0.2));

        manager.evaluate(&metric("db", 0.5, 10.0));
        std::thread::sleep(Duration::from_millis(30));
        manager.evaluate(&metric("db", 0.5, 10.0));

        assert_eq!(dispatcher.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_latency_metric_rule() {
        let (manager, dispatcher) = manager(1000);
        manager.add_rule(AlertRule {
            id: "lat".to_string(),
            service: "llm-openai".to_string(),
            metric: AlertMetric::AvgResponseTimeMs,
            threshold: 5_000.0,
            operator: AlertOperator::Gt,
            severity: AlertSeverity::Critical,
            enabled: true,
        });

        manager.evaluate(&metric("llm-openai", 0.0, 8_000.0));
        assert_eq!(dispatcher.events.lock().unwrap().len(), 1);
    }
}
