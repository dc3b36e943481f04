//! Resilience core for the Scribe real-time meeting copilot.
//!
//! Every call Scribe makes to a flaky external dependency — speech-to-text
//! providers, LLM providers, the datastore, the cache — passes through this
//! crate. It provides:
//!
//! - **Circuit breaking**: per-dependency gates that shed load once a
//!   dependency keeps failing ([`circuit_breaker`])
//! - **Retry**: configurable backoff-and-jitter schedules ([`retry`])
//! - **Health**: per-service error/latency tracking with derived status and
//!   debounced alert rules ([`health`], [`alerting`], [`monitor`])
//! - **Recovery planning**: a per-error-kind decision (retry, fail over,
//!   manual, ignore) and the machinery to carry it out ([`recovery`])
//!
//! The crate is an in-process, best-effort layer: it performs no network
//! calls itself, persists nothing, and shares nothing across processes.
//! Callers time out their own operations; a hung operation hangs here too.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scribe_resilience::{
//!     CircuitConfig, CircuitRegistry, HealthAggregator, RecoveryPlanner,
//! };
//!
//! # async fn example() {
//! let circuits = Arc::new(CircuitRegistry::new());
//! circuits.register("llm-openai", CircuitConfig::default()).await;
//! circuits.register("db", CircuitConfig::default()).await;
//!
//! let health = Arc::new(HealthAggregator::new());
//! let planner = RecoveryPlanner::new(Arc::clone(&circuits), Arc::clone(&health));
//!
//! match planner.execute("llm-openai", || async {
//!     // the actual provider call goes here
//!     Ok("completion".to_string())
//! }).await {
//!     Ok(text) => println!("{text}"),
//!     Err(outcome) => eprintln!("{}: {}", outcome.error, outcome.action.message),
//! }
//! # }
//! ```

pub mod alerting;
pub mod circuit_breaker;
pub mod error;
pub mod health;
pub mod monitor;
pub mod recovery;
pub mod retry;

// Re-export commonly used types
pub use alerting::{
    AlertDispatcher, AlertEvent, AlertManager, AlertMetric, AlertOperator, AlertRule,
    AlertSeverity, TracingDispatcher,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState, CircuitStats,
};
pub use error::{AppError, ErrorContext, ErrorKind, Result, Severity};
pub use health::{HealthAggregator, HealthConfig, HealthMetric, HealthStatus, SystemHealth};
pub use monitor::{HealthMonitor, HealthProbe, MonitorConfig};
pub use recovery::{
    ActionType, RecoveryAction, RecoveryHook, RecoveryOutcome, RecoveryPlanner,
};
pub use retry::{conditions, RetryCondition, RetryExecutor, RetryPolicy};
