//! Dispatch configuration and defaults

use std::time::Duration;

use super::admission::AdmissionLimits;
use super::retry::RetryPolicy;
use super::DispatchError;

/// Default number of concurrent workers.
/// Eight in-flight calls saturate a typical 50 requests/minute quota without
/// queueing a large number of calls behind the admission gate.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default request ceiling per window.
pub const DEFAULT_COUNT_CEILING: u64 = 50;

/// Default cost-unit ceiling per window.
pub const DEFAULT_COST_CEILING: u64 = 40_000;

/// Default sliding window length. External quotas are expressed per minute.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default fractional headroom kept below both nominal ceilings (0.0 - 0.5).
pub const DEFAULT_HEADROOM: f64 = 0.0;

/// Time margin added to every computed admission wait.
/// 100 ms absorbs clock jitter between the admission check and the moment
/// the call actually reaches the service.
pub const DEFAULT_WAIT_SLACK: Duration = Duration::from_millis(100);

/// Maximum number of retries after the first attempt.
pub const MAX_RETRIES: u32 = 5;

/// Base backoff for network-level failures.
pub const TRANSIENT_BASE_BACKOFF_MS: u64 = 1_000;

/// Base backoff for explicit quota rejections.
/// Longer than the transient base: a quota rejection means the window is
/// full, and the next slot opens on the order of seconds, not milliseconds.
pub const RATE_LIMITED_BASE_BACKOFF_MS: u64 = 5_000;

/// Backoff cap (5 minutes).
pub const MAX_BACKOFF_MS: u64 = 300_000;

/// Default jitter as a fraction of the computed delay.
pub const DEFAULT_JITTER: f64 = 0.1;

/// Checkpoint flush interval (flush every N terminal results).
/// 100 results bounds the work redone after a crash to a few seconds of
/// quota while keeping checkpoint writes infrequent.
pub const FLUSH_INTERVAL: usize = 100;

/// Per-call timeout. A call exceeding it is retried as a transient failure.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Cost reserved per call when the invoker cannot estimate it.
pub const DEFAULT_ESTIMATED_COST: u64 = 100;

/// Upper bound on worker concurrency
pub const MAX_CONCURRENCY: usize = 256;

/// Full configuration of a dispatch run
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Maximum calls per window
    pub count_ceiling: u64,
    /// Maximum cost units per window
    pub cost_ceiling: u64,
    /// Sliding window length
    pub window: Duration,
    /// Fraction of each ceiling kept in reserve
    pub headroom: f64,
    /// Margin added to admission waits
    pub wait_slack: Duration,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Base backoff for transient errors
    pub transient_backoff: Duration,
    /// Base backoff for quota rejections
    pub rate_limited_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Random jitter fraction applied to backoff delays
    pub jitter: f64,
    /// Flush the checkpoint every N terminal results
    pub flush_interval: usize,
    /// Timeout of a single external call
    pub call_timeout: Duration,
    /// Cost reserved per call when the invoker gives no estimate
    pub estimated_cost: u64,
    /// Archive the checkpoint once every item succeeded
    pub archive_on_success: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            count_ceiling: DEFAULT_COUNT_CEILING,
            cost_ceiling: DEFAULT_COST_CEILING,
            window: DEFAULT_WINDOW,
            headroom: DEFAULT_HEADROOM,
            wait_slack: DEFAULT_WAIT_SLACK,
            max_retries: MAX_RETRIES,
            transient_backoff: Duration::from_millis(TRANSIENT_BASE_BACKOFF_MS),
            rate_limited_backoff: Duration::from_millis(RATE_LIMITED_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            jitter: DEFAULT_JITTER,
            flush_interval: FLUSH_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            estimated_cost: DEFAULT_ESTIMATED_COST,
            archive_on_success: true,
        }
    }
}

impl DispatchConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(DispatchError::InvalidConfig(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            )));
        }
        if self.count_ceiling == 0 {
            return Err(DispatchError::InvalidConfig(
                "count ceiling must be at least 1".to_string(),
            ));
        }
        if self.cost_ceiling == 0 {
            return Err(DispatchError::InvalidConfig(
                "cost ceiling must be at least 1".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "window duration must be positive".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.headroom) {
            return Err(DispatchError::InvalidConfig(format!(
                "headroom must be between 0.0 and 0.5, got {}",
                self.headroom
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DispatchError::InvalidConfig(format!(
                "jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            )));
        }
        if self.flush_interval == 0 {
            return Err(DispatchError::InvalidConfig(
                "flush interval must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "call timeout must be positive".to_string(),
            ));
        }
        if self.transient_backoff > self.max_backoff || self.rate_limited_backoff > self.max_backoff
        {
            return Err(DispatchError::InvalidConfig(
                "base backoff must not exceed the backoff cap".to_string(),
            ));
        }
        let (_, cost_ceiling) = self.admission_limits().base_ceilings();
        if self.estimated_cost > cost_ceiling {
            return Err(DispatchError::InvalidConfig(format!(
                "estimated cost {} exceeds the effective cost ceiling {cost_ceiling}",
                self.estimated_cost
            )));
        }
        Ok(())
    }

    /// Admission limits derived from this configuration
    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            count_ceiling: self.count_ceiling,
            cost_ceiling: self.cost_ceiling,
            window: self.window,
            headroom: self.headroom,
            wait_slack: self.wait_slack,
        }
    }

    /// Retry policy derived from this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            transient_base: self.transient_backoff,
            rate_limited_base: self.rate_limited_backoff,
            max_delay: self.max_backoff,
            jitter: self.jitter,
        }
    }
}
