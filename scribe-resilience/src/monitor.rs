//! Periodic background work owned by the health layer.
//!
//! Two tasks, both scoped to the monitor's lifetime and stopped
//! deterministically through a watch channel: a sweep that runs every
//! registered [`HealthProbe`] (default every minute) and feeds the outcomes
//! into the aggregator, and the hourly error-counter reset.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::health::HealthAggregator;

/// Intervals for the background tasks. Tests shrink these.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the probe sweep runs
    pub sweep_interval: Duration,
    /// How often error counters are reset
    pub reset_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            reset_interval: Duration::from_secs(3600),
        }
    }
}

/// A synthetic health check for one logical service, independent of the
/// error/latency reports arriving from the call path.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// The logical service this probe reports for
    fn service(&self) -> &str;

    /// Perform the check; the returned duration is recorded as a
    /// response-time sample.
    async fn check(&self) -> Result<Duration>;
}

/// Owns the sweep and reset tasks. Probes are registered up front; `start`
/// spawns the tasks and `stop` joins them.
pub struct HealthMonitor {
    aggregator: Arc<HealthAggregator>,
    probes: Vec<Arc<dyn HealthProbe>>,
    config: MonitorConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(aggregator: Arc<HealthAggregator>, config: MonitorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            aggregator,
            probes: Vec::new(),
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a probe. Builder-style; call before `start`.
    pub fn register_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Spawn the sweep and reset tasks. A second call is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Health monitor already started");
            return;
        }
        info!(
            "Starting health monitor ({} probes, sweep every {:?})",
            self.probes.len(),
            self.config.sweep_interval
        );

        {
            let aggregator = Arc::clone(&self.aggregator);
            let probes = self.probes.clone();
            let interval = self.config.sweep_interval;
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            debug!("Health sweep task stopping");
                            break;
                        }
                        _ = ticker.tick() => {
                            sweep(&aggregator, &probes).await;
                        }
                    }
                }
            }));
        }

        {
            let aggregator = Arc::clone(&self.aggregator);
            let interval = self.config.reset_interval;
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately; counters are fresh.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            debug!("Error-counter reset task stopping");
                            break;
                        }
                        _ = ticker.tick() => {
                            aggregator.reset_error_counters();
                        }
                    }
                }
            }));
        }
    }

    /// Signal both tasks and wait for them to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("Health monitor stopped");
    }
}

async fn sweep(aggregator: &HealthAggregator, probes: &[Arc<dyn HealthProbe>]) {
    let checks = probes.iter().map(|probe| {
        let probe = Arc::clone(probe);
        async move {
            let service = probe.service().to_string();
            let outcome = probe.check().await;
            (service, outcome)
        }
    });

    for (service, outcome) in join_all(checks).await {
        match outcome {
            Ok(latency) => {
                aggregator.record_response_time(&service, latency.as_secs_f64() * 1000.0);
            }
            Err(err) => {
                warn!("Health probe for {} failed: {}", service, err);
                aggregator.record_error(&service);
            }
        }
    }
}
