//! Per-service health tracking and system rollup.
//!
//! The aggregator accumulates two rolling inputs per logical service: an
//! error counter (reset hourly by the monitor's background task) and a
//! bounded FIFO of the last 100 response-time samples. Everything else —
//! error rate, average latency, the three-level status — is derived on
//! demand, never stored authoritatively.
//!
//! Every report also evaluates the service's alert rules, so alerting stays
//! in step with the data without a separate polling loop for the synchronous
//! path (the periodic sweep in [`crate::monitor`] is layered on top).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::alerting::AlertManager;

/// Samples kept per service for the latency average.
const MAX_RESPONSE_SAMPLES: usize = 100;

/// Divisor turning the hourly error count into an errors-per-minute proxy.
const ERROR_RATE_WINDOW_MINUTES: f64 = 60.0;

const UNHEALTHY_ERROR_RATE: f64 = 0.2;
const UNHEALTHY_AVG_MS: f64 = 10_000.0;
const DEGRADED_ERROR_RATE: f64 = 0.1;
const DEGRADED_AVG_MS: f64 = 5_000.0;

/// Health status of a service or the overall system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with reduced quality
    Degraded,
    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// Returns true if the status is healthy or degraded
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Combines two statuses, returning the worse one.
    pub fn combine(&self, other: &HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Derived health view of one logical service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetric {
    pub service: String,
    pub status: HealthStatus,
    /// Errors-per-minute approximation over the current hourly window
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_check: DateTime<Utc>,
}

/// Rollup across every tracked service.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub services: HashMap<String, HealthMetric>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregator tuning. The defaults match production behavior; tests shrink
/// the debounce window instead of mocking time.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Minimum interval between repeated firings of the same alert rule
    pub alert_debounce: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alert_debounce: Duration::from_secs(300),
        }
    }
}

/// Rolling inputs for one service. Guarded by its `DashMap` entry lock.
#[derive(Default)]
struct ServiceState {
    error_count: u64,
    response_times: VecDeque<f64>,
}

fn derive_status(error_rate: f64, avg_response_time_ms: f64) -> HealthStatus {
    if error_rate > UNHEALTHY_ERROR_RATE || avg_response_time_ms > UNHEALTHY_AVG_MS {
        HealthStatus::Unhealthy
    } else if error_rate > DEGRADED_ERROR_RATE || avg_response_time_ms > DEGRADED_AVG_MS {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Tracks error counts and latency samples per logical service and derives
/// health. Services appear lazily on their first report.
pub struct HealthAggregator {
    services: DashMap<String, ServiceState>,
    alerts: AlertManager,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    pub fn with_config(config: HealthConfig) -> Self {
        Self::with_alerts(AlertManager::new(config.alert_debounce))
    }

    /// Build around a pre-configured alert manager (custom dispatcher).
    pub fn with_alerts(alerts: AlertManager) -> Self {
        Self {
            services: DashMap::new(),
            alerts,
        }
    }

    /// Alert-rule CRUD and evaluation surface.
    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    /// Count one error against `service`, recompute its metric and evaluate
    /// its alert rules.
    pub fn record_error(&self, service: &str) {
        let metric = {
            let mut state = self.services.entry(service.to_string()).or_default();
            state.error_count += 1;
            metric_of(service, &state)
        };
        self.alerts.evaluate(&metric);
    }

    /// Append a response-time sample (bounded window), recompute the metric
    /// and evaluate alert rules.
    pub fn record_response_time(&self, service: &str, millis: f64) {
        let metric = {
            let mut state = self.services.entry(service.to_string()).or_default();
            state.response_times.push_back(millis);
            if state.response_times.len() > MAX_RESPONSE_SAMPLES {
                state.response_times.pop_front();
            }
            metric_of(service, &state)
        };
        self.alerts.evaluate(&metric);
    }

    pub fn get_service_health(&self, service: &str) -> Option<HealthMetric> {
        self.services
            .get(service)
            .map(|state| metric_of(service, &state))
    }

    /// Rollup: unhealthy if any service is unhealthy, else degraded if any
    /// is degraded, else healthy.
    pub fn get_system_health(&self) -> SystemHealth {
        let mut services = HashMap::new();
        let mut status = HealthStatus::Healthy;
        for entry in self.services.iter() {
            let metric = metric_of(entry.key(), entry.value());
            status = status.combine(&metric.status);
            services.insert(entry.key().clone(), metric);
        }
        SystemHealth {
            status,
            services,
            timestamp: Utc::now(),
        }
    }

    /// Zero every service's error counter. Invoked hourly by the monitor's
    /// reset task; also available for operator intervention.
    pub fn reset_error_counters(&self) {
        for mut entry in self.services.iter_mut() {
            entry.error_count = 0;
        }
        info!("Hourly error counters reset");
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn metric_of(service: &str, state: &ServiceState) -> HealthMetric {
    let error_rate = state.error_count as f64 / ERROR_RATE_WINDOW_MINUTES;
    let avg_response_time_ms = if state.response_times.is_empty() {
        0.0
    } else {
        state.response_times.iter().sum::<f64>() / state.response_times.len() as f64
    };
    HealthMetric {
        service: service.to_string(),
        status: derive_status(error_rate, avg_response_time_ms),
        error_rate,
        avg_response_time_ms,
        last_check: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{
        AlertDispatcher, AlertEvent, AlertMetric, AlertOperator, AlertRule, AlertSeverity,
    };
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    #[rstest]
    #[case(0.0, 0.0, HealthStatus::Healthy)]
    #[case(0.1, 0.0, HealthStatus::Healthy)]
    #[case(0.11, 0.0, HealthStatus::Degraded)]
    #[case(0.0, 5_001.0, HealthStatus::Degraded)]
    #[case(0.21, 0.0, HealthStatus::Unhealthy)]
    #[case(0.0, 10_001.0, HealthStatus::Unhealthy)]
    #[case(0.15, 12_000.0, HealthStatus::Unhealthy)]
    fn test_status_derivation(
        #[case] error_rate: f64,
        #[case] avg_ms: f64,
        #[case] expected: HealthStatus,
    ) {
        assert_eq!(derive_status(error_rate, avg_ms), expected);
    }

    #[test]
    fn test_status_combine_returns_worst() {
        assert_eq!(
            HealthStatus::Healthy.combine(&HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.combine(&HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.combine(&HealthStatus::Healthy),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_services_appear_lazily() {
        let aggregator = HealthAggregator::new();
        assert!(aggregator.get_service_health("db").is_none());

        aggregator.record_error("db");
        let metric = aggregator.get_service_health("db").unwrap();
        assert_eq!(metric.service, "db");
    }

    #[test]
    fn test_error_rate_is_count_over_sixty() {
        let aggregator = HealthAggregator::new();
        for _ in 0..6 {
            aggregator.record_error("db");
        }
        let metric = aggregator.get_service_health("db").unwrap();
        assert!((metric.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(metric.status, HealthStatus::Healthy);

        aggregator.record_error("db");
        let metric = aggregator.get_service_health("db").unwrap();
        assert_eq!(metric.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_thirteen_errors_mark_unhealthy() {
        let aggregator = HealthAggregator::new();
        for _ in 0..13 {
            aggregator.record_error("llm-openai");
        }
        let metric = aggregator.get_service_health("llm-openai").unwrap();
        assert_eq!(metric.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_latency_window_is_bounded_to_last_hundred() {
        let aggregator = HealthAggregator::new();
        for _ in 0..50 {
            aggregator.record_response_time("llm-openai", 1_000.0);
        }
        for _ in 0..100 {
            aggregator.record_response_time("llm-openai", 2_000.0);
        }
        let metric = aggregator.get_service_health("llm-openai").unwrap();
        // The first 50 samples fell out of the window.
        assert!((metric.avg_response_time_ms - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_slow_service_degrades_then_unhealthy() {
        let aggregator = HealthAggregator::new();
        aggregator.record_response_time("transcription", 6_000.0);
        assert_eq!(
            aggregator.get_service_health("transcription").unwrap().status,
            HealthStatus::Degraded
        );

        aggregator.record_response_time("transcription", 30_000.0);
        assert_eq!(
            aggregator.get_service_health("transcription").unwrap().status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_system_health_rolls_up_worst_status() {
        let aggregator = HealthAggregator::new();
        aggregator.record_response_time("db", 100.0);
        aggregator.record_response_time("cache", 6_000.0);

        let system = aggregator.get_system_health();
        assert_eq!(system.status, HealthStatus::Degraded);
        assert_eq!(system.services.len(), 2);

        for _ in 0..13 {
            aggregator.record_error("llm-openai");
        }
        assert_eq!(aggregator.get_system_health().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_empty_system_is_healthy() {
        let aggregator = HealthAggregator::new();
        let system = aggregator.get_system_health();
        assert_eq!(system.status, HealthStatus::Healthy);
        assert!(system.services.is_empty());
    }

    #[test]
    fn test_reset_error_counters_restores_health() {
        let aggregator = HealthAggregator::new();
        for _ in 0..13 {
            aggregator.record_error("db");
        }
        assert_eq!(
            aggregator.get_service_health("db").unwrap().status,
            HealthStatus::Unhealthy
        );

        aggregator.reset_error_counters();
        assert_eq!(
            aggregator.get_service_health("db").unwrap().status,
            HealthStatus::Healthy
        );
    }

    #[derive(Default)]
    struct CapturingDispatcher {
        events: Mutex<Vec<AlertEvent>>,
    }

    impl AlertDispatcher for CapturingDispatcher {
        fn dispatch(&self, event: &AlertEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_reports_evaluate_alert_rules() {
        let dispatcher = Arc::new(CapturingDispatcher::default());
        let alerts = AlertManager::with_dispatcher(Duration::from_secs(300), dispatcher.clone());
        alerts.add_rule(AlertRule {
            id: "db-errors".to_string(),
            service: "db".to_string(),
            metric: AlertMetric::ErrorRate,
            threshold: 0.1,
            operator: AlertOperator::Gt,
            severity: AlertSeverity::Critical,
            enabled: true,
        });
        let aggregator = HealthAggregator::with_alerts(alerts);

        for _ in 0..7 {
            aggregator.record_error("db");
        }

        // Breached on the seventh report, debounced thereafter.
        assert_eq!(dispatcher.events.lock().unwrap().len(), 1);
    }
}
