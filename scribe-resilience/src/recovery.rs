//! Error classification and recovery planning.
//!
//! The planner is the composition root of the resilience layer: it turns a
//! raw failure into a classified [`AppError`], decides per kind whether to
//! retry, fail over, or hand the problem to a human, and drives the
//! automated paths through [`RetryExecutor`] and caller-registered
//! [`RecoveryHook`]s. Every error it sees is reported to the
//! [`HealthAggregator`]; automated recovery that fails escalates to a
//! critical `ServiceUnavailable` and a manual action — failures are never
//! swallowed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scribe_resilience::circuit_breaker::{CircuitConfig, CircuitRegistry};
//! use scribe_resilience::health::HealthAggregator;
//! use scribe_resilience::recovery::RecoveryPlanner;
//!
//! # async fn example() {
//! let circuits = Arc::new(CircuitRegistry::new());
//! circuits.register("llm-openai", CircuitConfig::default()).await;
//! let health = Arc::new(HealthAggregator::new());
//! let planner = RecoveryPlanner::new(circuits, health);
//!
//! match planner.execute("llm-openai", || async { Ok("completion".to_string()) }).await {
//!     Ok(text) => println!("{text}"),
//!     Err(outcome) => println!("{}", outcome.action.message),
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::circuit_breaker::CircuitRegistry;
use crate::error::{AppError, ErrorKind, Result, Severity};
use crate::health::HealthAggregator;
use crate::retry::{RetryExecutor, RetryPolicy};

/// What the planner decides to do about an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Retry the failed call with backoff
    Retry,
    /// Fail over to an alternative (device, provider)
    Fallback,
    /// A human has to intervene; retrying cannot help
    Manual,
    /// Safe to continue without the dependency
    Ignore,
}

impl ActionType {
    /// The default action for each error kind. Total by construction; a new
    /// kind without a decision here does not compile.
    pub fn for_kind(kind: ErrorKind) -> ActionType {
        match kind {
            ErrorKind::AudioPermissionDenied => ActionType::Manual,
            ErrorKind::AudioDeviceNotFound => ActionType::Fallback,
            ErrorKind::AudioStreamLost => ActionType::Retry,
            ErrorKind::AudioFormatUnsupported => ActionType::Manual,
            ErrorKind::TranscriptionTimeout => ActionType::Fallback,
            ErrorKind::TranscriptionFailed => ActionType::Fallback,
            ErrorKind::TranscriptionRateLimited => ActionType::Retry,
            ErrorKind::TranscriptionQuotaExceeded => ActionType::Fallback,
            ErrorKind::LlmProviderFailure => ActionType::Fallback,
            ErrorKind::LlmRateLimited => ActionType::Retry,
            ErrorKind::LlmTimeout => ActionType::Retry,
            ErrorKind::LlmInvalidResponse => ActionType::Retry,
            ErrorKind::DatabaseConnectionFailed => ActionType::Retry,
            ErrorKind::DatabaseQueryFailed => ActionType::Manual,
            ErrorKind::CacheUnavailable => ActionType::Ignore,
            ErrorKind::WebSocketConnectionFailed => ActionType::Retry,
            ErrorKind::NetworkTimeout => ActionType::Retry,
            ErrorKind::NetworkUnreachable => ActionType::Retry,
            ErrorKind::QuotaExceeded => ActionType::Manual,
            ErrorKind::ServiceUnavailable => ActionType::Manual,
            ErrorKind::ConfigurationError => ActionType::Manual,
            ErrorKind::Unknown => ActionType::Manual,
        }
    }

    pub fn is_automated(&self) -> bool {
        !matches!(self, ActionType::Manual)
    }
}

/// The planner's decision, always returned to the caller so the UI/API layer
/// can render guidance.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAction {
    pub action: ActionType,
    pub automated: bool,
    /// Human-readable summary ("switching provider", "grant permission", ...)
    pub message: String,
    /// Step-by-step guidance for manual actions; empty otherwise
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<String>,
}

/// Returned by [`RecoveryPlanner::execute`] when recovery did not produce a
/// value: the (possibly escalated) error plus the action for the caller.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub error: AppError,
    pub action: RecoveryAction,
}

impl std::fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (action: {:?})", self.error, self.action.action)
    }
}

impl std::error::Error for RecoveryOutcome {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A caller-supplied recovery step for one error kind: switch the input
/// device, rotate to the next provider, reconnect the socket.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    async fn recover(&self, error: &AppError) -> Result<()>;
}

/// Decides and drives recovery. One instance per process, alongside the
/// registry and aggregator it composes.
pub struct RecoveryPlanner {
    circuits: Arc<CircuitRegistry>,
    health: Arc<HealthAggregator>,
    executor: RetryExecutor,
    hooks: RwLock<HashMap<ErrorKind, Arc<dyn RecoveryHook>>>,
}

impl RecoveryPlanner {
    pub fn new(circuits: Arc<CircuitRegistry>, health: Arc<HealthAggregator>) -> Self {
        Self {
            circuits,
            health,
            executor: RetryExecutor::new(),
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Register the recovery step for an error kind, replacing any previous
    /// hook for that kind.
    pub async fn register_hook(&self, kind: ErrorKind, hook: Arc<dyn RecoveryHook>) {
        self.hooks.write().await.insert(kind, hook);
    }

    /// Turn a raw failure into an [`AppError`]. An error that already is one
    /// passes through unchanged; anything else gets a kind inferred from the
    /// service name and message, with the original kept as the cause.
    pub fn classify(
        &self,
        error: anyhow::Error,
        service: &str,
        operation: &str,
    ) -> AppError {
        match error.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => {
                let message = other.to_string();
                let kind = infer_kind(service, &message.to_lowercase());
                AppError::new(kind, service, operation, message).with_cause(other)
            }
        }
    }

    /// Pure lookup: error kind to recovery action.
    pub fn plan_recovery(&self, kind: ErrorKind) -> RecoveryAction {
        let action = ActionType::for_kind(kind);
        let (message, instructions) = guidance(kind);
        RecoveryAction {
            action,
            automated: action.is_automated(),
            message: message.to_string(),
            instructions: instructions.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Classify-free entry point: report the error, look up its action and,
    /// for automated actions, run the registered hook (retried with backoff
    /// for `Retry` actions). Escalates to a manual action if the hook fails.
    /// The action is always returned.
    pub async fn handle(&self, error: AppError) -> RecoveryAction {
        self.report(&error);
        let action = self.plan_recovery(error.kind);
        if !action.automated {
            return action;
        }

        let hook = self.hooks.read().await.get(&error.kind).cloned();
        match action.action {
            ActionType::Retry => {
                if let Some(hook) = hook {
                    let policy = self.policy_for(error.kind);
                    if let Err(failure) =
                        self.executor.run(&policy, || hook.recover(&error)).await
                    {
                        return self.escalate(&error, failure).action;
                    }
                } else {
                    debug!("No recovery hook registered for {}", error.kind);
                }
            }
            ActionType::Fallback => {
                if let Some(hook) = hook {
                    if let Err(failure) = hook.recover(&error).await {
                        return self.escalate(&error, failure).action;
                    }
                } else {
                    debug!("No recovery hook registered for {}", error.kind);
                }
            }
            ActionType::Ignore | ActionType::Manual => {}
        }
        action
    }

    /// Gate `operation` through the named circuit and recover from failures
    /// in place: retries re-enter the gated call, fallback hooks run once and
    /// the call is re-entered, successes report their latency. When no value
    /// can be produced the caller receives the error and the action together.
    pub async fn execute<F, Fut, T>(
        &self,
        circuit: &str,
        operation: F,
    ) -> std::result::Result<T, RecoveryOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match self.circuits.execute(circuit, || operation()).await {
            Ok(value) => {
                self.health
                    .record_response_time(circuit, started.elapsed().as_secs_f64() * 1000.0);
                Ok(value)
            }
            Err(err) => self.recover_guarded(circuit, &operation, err).await,
        }
    }

    async fn recover_guarded<F, Fut, T>(
        &self,
        circuit: &str,
        operation: &F,
        err: AppError,
    ) -> std::result::Result<T, RecoveryOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.report(&err);
        let action = self.plan_recovery(err.kind);

        match action.action {
            ActionType::Retry => {
                let policy = self.policy_for(err.kind);
                match self
                    .executor
                    .run(&policy, || self.circuits.execute(circuit, || operation()))
                    .await
                {
                    Ok(value) => Ok(value),
                    Err(failure) => Err(self.escalate(&err, failure)),
                }
            }
            ActionType::Fallback => {
                let hook = self.hooks.read().await.get(&err.kind).cloned();
                match hook {
                    Some(hook) => match hook.recover(&err).await {
                        Ok(()) => match self.circuits.execute(circuit, || operation()).await {
                            Ok(value) => Ok(value),
                            Err(failure) => Err(self.escalate(&err, failure)),
                        },
                        Err(failure) => Err(self.escalate(&err, failure)),
                    },
                    None => {
                        debug!("No recovery hook registered for {}", err.kind);
                        Err(RecoveryOutcome { error: err, action })
                    }
                }
            }
            ActionType::Ignore | ActionType::Manual => Err(RecoveryOutcome { error: err, action }),
        }
    }

    /// Retry schedule per kind: rate limits get patience, the datastore gets
    /// short timeouts, socket reconnects keep trying.
    fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        match kind {
            ErrorKind::TranscriptionRateLimited | ErrorKind::LlmRateLimited => RetryPolicy::slow(),
            ErrorKind::DatabaseConnectionFailed => RetryPolicy::fast(),
            ErrorKind::WebSocketConnectionFailed => RetryPolicy::persistent(),
            _ => RetryPolicy::standard(),
        }
    }

    fn report(&self, error: &AppError) {
        match error.severity {
            Severity::Critical | Severity::High => error!("{}", error),
            Severity::Medium => warn!("{}", error),
            Severity::Low => debug!("{}", error),
        }
        self.health.record_error(&error.context.service);
    }

    /// Automated recovery failed: report a critical `ServiceUnavailable` and
    /// hand the problem back to a human.
    fn escalate(&self, original: &AppError, failure: AppError) -> RecoveryOutcome {
        error!(
            "Automated recovery for {} on {} failed: {}",
            original.kind, original.context.service, failure
        );
        let escalated = AppError::new(
            ErrorKind::ServiceUnavailable,
            original.context.service.clone(),
            original.context.operation.clone(),
            format!("automated recovery failed: {}", failure),
        )
        .with_cause(failure);
        self.health.record_error(&escalated.context.service);

        RecoveryOutcome {
            error: escalated,
            action: RecoveryAction {
                action: ActionType::Manual,
                automated: false,
                message: "The service is temporarily unavailable.".to_string(),
                instructions: vec![
                    "Wait a few minutes and try again".to_string(),
                    "If the problem persists, contact support".to_string(),
                ],
            },
        }
    }
}

/// Per-kind user-facing guidance.
fn guidance(kind: ErrorKind) -> (&'static str, &'static [&'static str]) {
    match kind {
        ErrorKind::AudioPermissionDenied => (
            "Microphone access is blocked.",
            &[
                "Open your browser or OS privacy settings",
                "Allow microphone access for this app",
                "Reload and rejoin the session",
            ],
        ),
        ErrorKind::AudioDeviceNotFound => ("Switching to the next available input device.", &[]),
        ErrorKind::AudioStreamLost => ("Reconnecting to your microphone.", &[]),
        ErrorKind::AudioFormatUnsupported => (
            "This audio format is not supported.",
            &[
                "Select a different input device",
                "Check the device's sample-rate settings",
            ],
        ),
        ErrorKind::TranscriptionTimeout | ErrorKind::TranscriptionFailed => {
            ("Switching transcription provider.", &[])
        }
        ErrorKind::TranscriptionQuotaExceeded => {
            ("Transcription quota exhausted, switching provider.", &[])
        }
        ErrorKind::TranscriptionRateLimited | ErrorKind::LlmRateLimited => {
            ("Provider is rate limiting, retrying with backoff.", &[])
        }
        ErrorKind::LlmProviderFailure => ("Switching assistant provider.", &[]),
        ErrorKind::LlmTimeout | ErrorKind::LlmInvalidResponse => {
            ("Retrying the assistant request.", &[])
        }
        ErrorKind::DatabaseConnectionFailed => ("Reconnecting to the datastore.", &[]),
        ErrorKind::DatabaseQueryFailed => (
            "A storage operation failed.",
            &["Try again", "If the problem persists, contact support"],
        ),
        ErrorKind::CacheUnavailable => ("Continuing without the cache.", &[]),
        ErrorKind::WebSocketConnectionFailed => ("Reconnecting...", &[]),
        ErrorKind::NetworkTimeout | ErrorKind::NetworkUnreachable => {
            ("Network trouble, retrying.", &[])
        }
        ErrorKind::QuotaExceeded => (
            "Your plan's quota is exhausted.",
            &["Review your usage in the billing dashboard", "Upgrade the plan or wait for the quota window to reset"],
        ),
        ErrorKind::ServiceUnavailable => (
            "The service is temporarily unavailable.",
            &["Wait a few minutes and try again"],
        ),
        ErrorKind::ConfigurationError => (
            "The application is misconfigured.",
            &["Check the service registration and configuration", "Contact the operator"],
        ),
        ErrorKind::Unknown => (
            "Something went wrong.",
            &["Try again", "If the problem persists, contact support"],
        ),
    }
}

/// Best-effort kind inference for errors that arrive unclassified. The
/// service name disambiguates shared symptoms (a 429 from the transcription
/// provider is not the same kind as one from the LLM).
fn infer_kind(service: &str, message: &str) -> ErrorKind {
    let service = service.to_lowercase();
    let transcription = service.contains("transcription") || service.contains("stt");
    let llm = service.contains("llm");

    if message.contains("rate limit") || message.contains("429") {
        return if transcription {
            ErrorKind::TranscriptionRateLimited
        } else if llm {
            ErrorKind::LlmRateLimited
        } else {
            ErrorKind::QuotaExceeded
        };
    }
    if message.contains("quota") {
        return if transcription {
            ErrorKind::TranscriptionQuotaExceeded
        } else {
            ErrorKind::QuotaExceeded
        };
    }
    if message.contains("timed out") || message.contains("timeout") {
        return if transcription {
            ErrorKind::TranscriptionTimeout
        } else if llm {
            ErrorKind::LlmTimeout
        } else {
            ErrorKind::NetworkTimeout
        };
    }
    if message.contains("permission denied") || message.contains("notallowed") {
        return if service.contains("audio") || service.contains("capture") {
            ErrorKind::AudioPermissionDenied
        } else {
            ErrorKind::ConfigurationError
        };
    }
    if message.contains("device not found") || message.contains("no input device") {
        return ErrorKind::AudioDeviceNotFound;
    }
    if service.contains("db") || service.contains("database") || service.contains("postgres") {
        return ErrorKind::DatabaseConnectionFailed;
    }
    if service.contains("cache") || service.contains("redis") {
        return ErrorKind::CacheUnavailable;
    }
    if service.contains("websocket") || service.contains("ws") {
        return ErrorKind::WebSocketConnectionFailed;
    }
    if message.contains("dns")
        || message.contains("unreachable")
        || message.contains("connection refused")
        || message.contains("connection reset")
    {
        return ErrorKind::NetworkUnreachable;
    }
    if llm {
        return ErrorKind::LlmProviderFailure;
    }
    if transcription {
        return ErrorKind::TranscriptionFailed;
    }
    ErrorKind::Unknown
}
