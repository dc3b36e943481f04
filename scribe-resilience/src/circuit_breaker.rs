//! Circuit breaker gating for flaky external dependencies.
//!
//! Every outbound dependency call is wrapped as
//! `registry.execute(name, operation)`. A named breaker tracks consecutive
//! failures and temporarily short-circuits the dependency once they cross a
//! threshold, giving it room to recover.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: threshold breached, calls are rejected until the recovery
//!   timeout elapses
//! - **HalfOpen**: a trial call is permitted to test recovery
//!
//! # Example
//!
//! ```no_run
//! use scribe_resilience::circuit_breaker::{CircuitConfig, CircuitRegistry};
//!
//! # async fn example() -> scribe_resilience::Result<()> {
//! let registry = CircuitRegistry::new();
//! registry.register("llm-openai", CircuitConfig::default()).await;
//!
//! let completion = registry
//!     .execute("llm-openai", || async {
//!         // the actual provider call goes here
//!         Ok("done".to_string())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{AppError, ErrorKind, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Too many consecutive failures, calls are rejected
    Open,
    /// Testing whether the dependency has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-circuit configuration, immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is permitted
    pub recovery_timeout: Duration,
    /// Reserved for rate-based opening; not consulted by the state machine
    pub monitoring_period: Duration,
    /// Reserved for rate-based opening; not consulted by the state machine
    pub expected_error_rate: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            expected_error_rate: 0.5,
        }
    }
}

/// Mutable circuit state. Every read-modify-write happens under the owning
/// breaker's write lock, which is never held across operation I/O.
struct CircuitInner {
    state: CircuitState,
    /// Consecutive failures since the last success
    failure_count: u32,
    /// Monotonic success counter, diagnostic only
    success_count: u64,
    last_failure_time: Option<Instant>,
    /// Set when the circuit opens; `Some` exactly while state != Closed
    next_attempt_time: Option<Instant>,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: RwLock<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        info!("Registering circuit breaker: {}", name);
        Self {
            name,
            config,
            inner: RwLock::new(CircuitInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state (snapshot).
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Decide whether a call may proceed. Commits the Open -> HalfOpen
    /// transition when the recovery timeout has elapsed.
    async fn admit(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => true,
            // A trial admitted by another caller is already in flight;
            // further calls pass through until its outcome commits.
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_attempt_time {
                    Some(next_attempt) if now >= next_attempt => {
                        info!("Circuit breaker {} transitioning to half-open", self.name);
                        inner.state = CircuitState::HalfOpen;
                        true
                    }
                    Some(_) => false,
                    None => {
                        // Opening always stamps the timer; this path only
                        // covers a circuit observed as open before the stamp.
                        warn!(
                            "Circuit breaker {} open without a recovery deadline, stamping one",
                            self.name
                        );
                        inner.next_attempt_time = Some(now + self.config.recovery_timeout);
                        false
                    }
                }
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.success_count += 1;
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit breaker {} closing after successful trial", self.name);
            inner.state = CircuitState::Closed;
            inner.next_attempt_time = None;
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker {} opening after {} consecutive failures",
                        self.name, inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                    inner.next_attempt_time = Some(Instant::now() + self.config.recovery_timeout);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker {} re-opening after failed trial", self.name);
                inner.state = CircuitState::Open;
                inner.next_attempt_time = Some(Instant::now() + self.config.recovery_timeout);
            }
            CircuitState::Open => {
                // In-flight call admitted before the circuit opened; the
                // existing recovery deadline stands.
            }
        }
    }

    /// Unconditionally force the circuit back to closed with zero counters.
    /// Operator intervention, not part of the state machine.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        info!("Manually resetting circuit breaker: {}", self.name);
        *inner = CircuitInner::new();
    }

    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.read().await;
        let now = Instant::now();
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_age_ms: inner
                .last_failure_time
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            next_attempt_in_ms: inner
                .next_attempt_time
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Read-only snapshot of a circuit, safe to hand to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_in_ms: Option<u64>,
}

/// Owns the named circuit breakers for the process.
///
/// One registry per process, passed by reference to collaborators. Circuits
/// must be registered at startup before use; an unknown name is a
/// configuration error, not a runtime fault.
#[derive(Default)]
pub struct CircuitRegistry {
    circuits: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a circuit in closed state with zero counters.
    /// Idempotent for startup re-registration.
    pub async fn register(&self, name: impl Into<String>, config: CircuitConfig) {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config));
        self.circuits.write().await.insert(name, breaker);
    }

    async fn breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>> {
        self.circuits.read().await.get(name).cloned().ok_or_else(|| {
            AppError::new(
                ErrorKind::ConfigurationError,
                name,
                "execute",
                format!("circuit '{}' is not registered", name),
            )
        })
    }

    /// Run `operation` through the named circuit. Rejected calls fail with
    /// `ServiceUnavailable`; failed calls propagate the original error.
    pub async fn execute<F, Fut, T>(&self, name: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_inner(name, operation, None::<fn() -> std::future::Ready<Result<T>>>)
            .await
    }

    /// Like [`execute`](Self::execute), but a rejected or failed call returns
    /// the fallback's result instead of an error.
    pub async fn execute_with_fallback<F, Fut, G, Gut, T>(
        &self,
        name: &str,
        operation: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> Gut,
        Gut: Future<Output = Result<T>>,
    {
        self.execute_inner(name, operation, Some(fallback)).await
    }

    async fn execute_inner<F, Fut, G, Gut, T>(
        &self,
        name: &str,
        operation: F,
        fallback: Option<G>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> Gut,
        Gut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(name).await?;

        // Gate check happens under the circuit's lock; the operation and
        // fallback run outside it.
        if !breaker.admit().await {
            debug!("Circuit breaker {} rejected a call", name);
            return match fallback {
                Some(fb) => fb().await,
                None => Err(AppError::new(
                    ErrorKind::ServiceUnavailable,
                    name,
                    "execute",
                    format!("circuit '{}' is open", name),
                )),
            };
        }

        match operation().await {
            Ok(value) => {
                breaker.record_success().await;
                Ok(value)
            }
            Err(err) => {
                breaker.record_failure().await;
                match fallback {
                    Some(fb) => fb().await,
                    None => Err(err),
                }
            }
        }
    }

    pub async fn get_stats(&self, name: &str) -> Option<CircuitStats> {
        let breaker = self.circuits.read().await.get(name).cloned()?;
        Some(breaker.stats().await)
    }

    pub async fn get_all_stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<_> = self.circuits.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub async fn is_open(&self, name: &str) -> bool {
        match self.circuits.read().await.get(name).cloned() {
            Some(breaker) => breaker.state().await == CircuitState::Open,
            None => false,
        }
    }

    /// Force the named circuit back to closed. Errors on an unknown name.
    pub async fn reset(&self, name: &str) -> Result<()> {
        let breaker = self.breaker(name).await?;
        breaker.reset().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn config(threshold: u32, recovery_ms: u64) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            ..Default::default()
        }
    }

    async fn registry_with(name: &str, threshold: u32, recovery_ms: u64) -> CircuitRegistry {
        let registry = CircuitRegistry::new();
        registry.register(name, config(threshold, recovery_ms)).await;
        registry
    }

    async fn fail_n(registry: &CircuitRegistry, name: &str, n: usize) {
        for _ in 0..n {
            let _ = registry
                .execute(name, || async {
                    Err::<(), _>(AppError::new(
                        ErrorKind::NetworkTimeout,
                        name,
                        "call",
                        "timed out",
                    ))
                })
                .await;
        }
    }

    #[tokio::test]
    async fn test_starts_closed_with_zero_counters() {
        let registry = registry_with("svc", 3, 1000).await;
        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert!(stats.next_attempt_in_ms.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_circuit_is_a_configuration_error() {
        let registry = CircuitRegistry::new();
        let result = registry.execute("nope", || async { Ok(1) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn test_threshold_opens_circuit_once() {
        let registry = registry_with("svc", 3, 1000).await;
        fail_n(&registry, "svc", 2).await;
        assert!(!registry.is_open("svc").await);

        fail_n(&registry, "svc", 1).await;
        assert!(registry.is_open("svc").await);

        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failure_count, 3);
        // Deadline stamped at opening time plus the recovery timeout.
        let remaining = stats.next_attempt_in_ms.unwrap();
        assert!(remaining <= 1000 && remaining > 800, "remaining={remaining}");
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let registry = registry_with("svc", 3, 1000).await;
        fail_n(&registry, "svc", 2).await;
        registry.execute("svc", || async { Ok(()) }).await.unwrap();

        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 1);

        // Two more failures must not open a threshold-3 circuit.
        fail_n(&registry, "svc", 2).await;
        assert!(!registry.is_open("svc").await);
    }

    #[tokio::test]
    async fn test_open_circuit_never_invokes_operation() {
        let registry = registry_with("svc", 2, 60_000).await;
        fail_n(&registry, "svc", 2).await;

        let calls = AtomicUsize::new(0);
        let result = registry
            .execute("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.unwrap_err().kind, ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_open_circuit_returns_fallback_result() {
        let registry = registry_with("svc", 2, 60_000).await;
        fail_n(&registry, "svc", 2).await;

        let calls = AtomicUsize::new(0);
        let result = registry
            .execute_with_fallback(
                "svc",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("primary")
                },
                || async { Ok("fallback") },
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_failure_with_fallback_still_counts() {
        let registry = registry_with("svc", 2, 60_000).await;
        let result = registry
            .execute_with_fallback(
                "svc",
                || async {
                    Err::<&str, _>(AppError::new(ErrorKind::LlmProviderFailure, "svc", "call", "boom"))
                },
                || async { Ok("fallback") },
            )
            .await;
        assert_eq!(result.unwrap(), "fallback");
        assert_eq!(registry.get_stats("svc").await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let registry = registry_with("svc", 2, 100).await;
        fail_n(&registry, "svc", 2).await;
        assert!(registry.is_open("svc").await);

        sleep(Duration::from_millis(150)).await;

        let calls = AtomicUsize::new(0);
        registry
            .execute("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert!(stats.next_attempt_in_ms.is_none());
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens_with_fresh_deadline() {
        let registry = registry_with("svc", 2, 100).await;
        fail_n(&registry, "svc", 2).await;

        sleep(Duration::from_millis(150)).await;
        fail_n(&registry, "svc", 1).await;

        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        let remaining = stats.next_attempt_in_ms.unwrap();
        assert!(remaining > 0, "fresh deadline expected, got {remaining}");
    }

    #[tokio::test]
    async fn test_reset_is_unconditional() {
        let registry = registry_with("svc", 2, 60_000).await;
        fail_n(&registry, "svc", 2).await;
        registry.reset("svc").await.unwrap();

        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert!(stats.last_failure_age_ms.is_none());
        assert!(stats.next_attempt_in_ms.is_none());

        registry.execute("svc", || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_unknown_circuit_errors() {
        let registry = CircuitRegistry::new();
        assert_eq!(
            registry.reset("nope").await.unwrap_err().kind,
            ErrorKind::ConfigurationError
        );
    }

    #[tokio::test]
    async fn test_reregistration_replaces_state() {
        let registry = registry_with("svc", 2, 60_000).await;
        fail_n(&registry, "svc", 2).await;
        assert!(registry.is_open("svc").await);

        registry.register("svc", config(2, 60_000)).await;
        assert!(!registry.is_open("svc").await);
        assert_eq!(registry.get_stats("svc").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_get_all_stats_lists_every_circuit() {
        let registry = CircuitRegistry::new();
        registry.register("db", CircuitConfig::default()).await;
        registry.register("cache", CircuitConfig::default()).await;

        let all = registry.get_all_stats().await;
        let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "db"]);
    }

    #[tokio::test]
    async fn test_racing_failures_open_exactly_once() {
        let registry = Arc::new(registry_with("svc", 5, 60_000).await);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let _ = registry
                    .execute("svc", || async {
                        Err::<(), _>(AppError::new(ErrorKind::NetworkTimeout, "svc", "call", "t/o"))
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // All writers agreed on one committed state.
        let stats = registry.get_stats("svc").await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.next_attempt_in_ms.is_some());
    }
}
