//! Failure classification and backoff policy

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::config::{
    MAX_BACKOFF_MS, MAX_RETRIES, RATE_LIMITED_BASE_BACKOFF_MS, TRANSIENT_BASE_BACKOFF_MS,
};
use crate::invoker::InvokeError;

/// Classification of a failed call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network-level failure or timeout; retryable
    Transient,
    /// Explicit quota rejection from the service; retryable with longer backoff
    RateLimited,
    /// Malformed request or validation rejection; never retried
    Permanent,
}

impl ErrorKind {
    /// Whether errors of this kind may be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }

    /// User-facing description used in retry log lines and reports
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "transient network error",
            Self::RateLimited => "quota exceeded",
            Self::Permanent => "request rejected",
        }
    }

    /// Suggested remediation shown next to grouped failures
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Transient => "Check network connectivity and re-run with --resume on",
            Self::RateLimited => "Lower --count-ceiling / --cost-ceiling or raise --headroom",
            Self::Permanent => "Inspect the payloads of these items; they will fail again as-is",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Permanent => "permanent",
        };
        f.write_str(name)
    }
}

/// Stateless retry policy: a pure function of (error kind, attempt number).
///
/// `attempt` is the zero-based index of the retry being considered, so the
/// first failure consults `attempt = 0` and at most `max_retries + 1` calls are
/// made per item.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Base delay for transient errors
    pub transient_base: Duration,
    /// Base delay for quota rejections
    pub rate_limited_base: Duration,
    /// Delay cap
    pub max_delay: Duration,
    /// Uniform random jitter as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            transient_base: Duration::from_millis(TRANSIENT_BASE_BACKOFF_MS),
            rate_limited_base: Duration::from_millis(RATE_LIMITED_BASE_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Map an invocation error onto the retry taxonomy
    pub fn classify(&self, error: &InvokeError) -> ErrorKind {
        match error {
            InvokeError::Timeout(_) | InvokeError::Network(_) | InvokeError::Server { .. } => {
                ErrorKind::Transient
            }
            InvokeError::RateLimited { .. } => ErrorKind::RateLimited,
            InvokeError::Rejected { .. } | InvokeError::Malformed(_) => ErrorKind::Permanent,
        }
    }

    /// Whether another attempt is allowed
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < self.max_retries
    }

    /// Exponential backoff `base * 2^attempt`, capped at `max_delay`
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let base = match kind {
            ErrorKind::RateLimited => self.rate_limited_base,
            ErrorKind::Transient | ErrorKind::Permanent => self.transient_base,
        };
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        base.checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`Self::next_delay`] plus uniform random jitter in `[0, jitter * delay]`,
    /// still capped at `max_delay`
    pub fn backoff(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let delay = self.next_delay(attempt, kind);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter);
        (delay + delay.mul_f64(fraction)).min(self.max_delay)
    }
}

/// Context for formatting retry log messages.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Item being retried
    pub item_id: &'a str,
    /// Number of the attempt about to start (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Classification of the error that triggered the retry
    pub kind: ErrorKind,
    /// Backoff duration until the next attempt
    pub backoff: Duration,
    /// Original error message
    pub error_message: &'a str,
}

impl RetryContext<'_> {
    /// Standardized retry message with attempt counters
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying item {} (attempt {}/{}) after {} - waiting {:.1} seconds...",
            self.item_id,
            self.attempt,
            self.max_attempts,
            self.kind.description(),
            self.backoff.as_secs_f64()
        )
    }

    /// Final failure summary with a remediation hint
    pub fn format_failure(&self) -> String {
        format!(
            "[FAILED] Item {} failed after {} attempts ({}): {}. {}",
            self.item_id,
            self.attempt,
            self.kind,
            self.error_message,
            self.kind.suggestion()
        )
    }
}
