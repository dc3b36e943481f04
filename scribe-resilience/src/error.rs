use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::recovery::ActionType;

/// Classified fault kinds, by origin: audio capture, transcription providers,
/// generation (LLM) providers, infrastructure, and the network in between.
///
/// The enum is closed on purpose: recovery planning is a total `match`, so
/// adding a kind without deciding its action and severity is a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Capture layer
    AudioPermissionDenied,
    AudioDeviceNotFound,
    AudioStreamLost,
    AudioFormatUnsupported,

    // Transcription providers
    TranscriptionTimeout,
    TranscriptionFailed,
    TranscriptionRateLimited,
    TranscriptionQuotaExceeded,

    // Generation (LLM) providers
    LlmProviderFailure,
    LlmRateLimited,
    LlmTimeout,
    LlmInvalidResponse,

    // Infrastructure
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    CacheUnavailable,
    WebSocketConnectionFailed,

    // Network
    NetworkTimeout,
    NetworkUnreachable,
    QuotaExceeded,

    // Control plane
    ServiceUnavailable,
    ConfigurationError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AudioPermissionDenied => "audio_permission_denied",
            ErrorKind::AudioDeviceNotFound => "audio_device_not_found",
            ErrorKind::AudioStreamLost => "audio_stream_lost",
            ErrorKind::AudioFormatUnsupported => "audio_format_unsupported",
            ErrorKind::TranscriptionTimeout => "transcription_timeout",
            ErrorKind::TranscriptionFailed => "transcription_failed",
            ErrorKind::TranscriptionRateLimited => "transcription_rate_limited",
            ErrorKind::TranscriptionQuotaExceeded => "transcription_quota_exceeded",
            ErrorKind::LlmProviderFailure => "llm_provider_failure",
            ErrorKind::LlmRateLimited => "llm_rate_limited",
            ErrorKind::LlmTimeout => "llm_timeout",
            ErrorKind::LlmInvalidResponse => "llm_invalid_response",
            ErrorKind::DatabaseConnectionFailed => "database_connection_failed",
            ErrorKind::DatabaseQueryFailed => "database_query_failed",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::WebSocketConnectionFailed => "websocket_connection_failed",
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::NetworkUnreachable => "network_unreachable",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Fixed severity per kind, used for alert and log routing only.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::AudioPermissionDenied => Severity::High,
            ErrorKind::AudioDeviceNotFound => Severity::Medium,
            ErrorKind::AudioStreamLost => Severity::Medium,
            ErrorKind::AudioFormatUnsupported => Severity::Low,
            ErrorKind::TranscriptionTimeout => Severity::Medium,
            ErrorKind::TranscriptionFailed => Severity::High,
            ErrorKind::TranscriptionRateLimited => Severity::Medium,
            ErrorKind::TranscriptionQuotaExceeded => Severity::High,
            ErrorKind::LlmProviderFailure => Severity::High,
            ErrorKind::LlmRateLimited => Severity::Medium,
            ErrorKind::LlmTimeout => Severity::Medium,
            ErrorKind::LlmInvalidResponse => Severity::Medium,
            ErrorKind::DatabaseConnectionFailed => Severity::Critical,
            ErrorKind::DatabaseQueryFailed => Severity::High,
            ErrorKind::CacheUnavailable => Severity::Medium,
            ErrorKind::WebSocketConnectionFailed => Severity::Medium,
            ErrorKind::NetworkTimeout => Severity::Medium,
            ErrorKind::NetworkUnreachable => Severity::High,
            ErrorKind::QuotaExceeded => Severity::High,
            ErrorKind::ServiceUnavailable => Severity::Critical,
            ErrorKind::ConfigurationError => Severity::Critical,
            ErrorKind::Unknown => Severity::Medium,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where and when a fault was observed.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    /// Logical service the fault belongs to (e.g. "llm-openai", "db")
    pub service: String,
    /// The operation that was being attempted
    pub operation: String,
    /// When the fault was detected
    pub timestamp: DateTime<Utc>,
    /// Correlates this fault across log lines and recovery attempts
    pub correlation_id: Uuid,
    /// The user session the fault occurred in, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ErrorContext {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            session_id: None,
        }
    }
}

/// A classified application fault.
///
/// Constructed at the boundary where a fault is detected, consumed by the
/// recovery planner and the health aggregator, then discarded. Nothing in
/// this crate persists errors.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub context: ErrorContext,
    /// The default action for this kind; the planner may still escalate.
    pub recovery: ActionType,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(
        kind: ErrorKind,
        service: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            context: ErrorContext::new(service, operation),
            recovery: ActionType::for_kind(kind),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.context.session_id = Some(session_id.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
