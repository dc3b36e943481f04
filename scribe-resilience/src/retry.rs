//! Retry execution with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value describing how often and how patiently
//! to retry; [`RetryExecutor::run`] drives an async operation under one.
//! Policies are built ad hoc or from the named presets
//! ([`fast`](RetryPolicy::fast), [`standard`](RetryPolicy::standard),
//! [`slow`](RetryPolicy::slow), [`persistent`](RetryPolicy::persistent)).
//!
//! The executor has no circuit awareness; composing retries with circuit
//! gating happens one layer up, in [`crate::recovery`].
//!
//! # Example
//!
//! ```no_run
//! use scribe_resilience::retry::{conditions, RetryExecutor, RetryPolicy};
//!
//! # async fn example() -> scribe_resilience::Result<()> {
//! let policy = RetryPolicy::standard().with_condition(conditions::http_transient());
//!
//! let value = RetryExecutor::new()
//!     .run(&policy, || async {
//!         // your operation here
//!         Ok(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Predicate deciding whether a failure is worth another attempt.
pub type RetryCondition = Arc<dyn Fn(&AppError) -> bool + Send + Sync>;

/// Value object describing a retry schedule. Immutable per call.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
    condition: Option<RetryCondition>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: true,
            condition: None,
        }
    }

    /// Short schedule for interactive paths.
    pub fn fast() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(1))
    }

    /// The default schedule.
    pub fn standard() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }

    /// Patient schedule for rate-limited providers.
    pub fn slow() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Keeps trying well past the point politeness would suggest.
    pub fn persistent() -> Self {
        Self {
            backoff_multiplier: 1.5,
            ..Self::new(10, Duration::from_secs(1), Duration::from_secs(60))
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Whether `error` should be retried under this policy. Policies without
    /// a condition retry everything.
    pub fn should_retry(&self, error: &AppError) -> bool {
        self.condition.as_ref().map_or(true, |c| c(error))
    }

    /// Pre-jitter delay after the given 1-based attempt:
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Realized delay after the given attempt, jitter applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter {
            use rand::Rng;
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

/// Built-in retry-condition builders.
pub mod conditions {
    use super::RetryCondition;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    /// Retry when any of `patterns` occurs as a substring of the error
    /// message or of the kind name (case-insensitive).
    pub fn match_any<I, S>(patterns: I) -> RetryCondition
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(|p| p.into().to_lowercase()).collect();
        Arc::new(move |error| {
            let message = error.message.to_lowercase();
            let kind = error.kind.as_str();
            patterns
                .iter()
                .any(|p| message.contains(p.as_str()) || kind.contains(p.as_str()))
        })
    }

    /// HTTP-shaped transience: connection resets, DNS failures, timeouts and
    /// status codes 408/429/502/503/504 are retryable; everything else is not.
    pub fn http_transient() -> RetryCondition {
        const TRANSIENT_MARKERS: &[&str] = &[
            "connection reset",
            "dns",
            "timed out",
            "timeout",
            "408",
            "429",
            "502",
            "503",
            "504",
        ];
        Arc::new(|error| {
            matches!(
                error.kind,
                ErrorKind::NetworkTimeout
                    | ErrorKind::TranscriptionTimeout
                    | ErrorKind::LlmTimeout
                    | ErrorKind::TranscriptionRateLimited
                    | ErrorKind::LlmRateLimited
            ) || {
                let message = error.message.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
            }
        })
    }
}

/// Drives an operation under a [`RetryPolicy`]. Stateless; the policy is the
/// only input besides the operation itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Invoke `operation` up to `policy.max_attempts` times, sleeping the
    /// policy's delay between attempts. The final error is propagated
    /// unchanged; a non-retryable error propagates immediately.
    pub async fn run<F, Fut, T>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}/{}", attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !policy.should_retry(&error) {
                        debug!("Error is not retryable, giving up: {}", error);
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        warn!("Giving up after {} attempts: {}", attempt, error);
                        return Err(error);
                    }
                    let delay = policy.next_delay(attempt);
                    debug!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, max_attempts, error, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
