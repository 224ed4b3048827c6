//! External analysis call
//!
//! The dispatcher never talks to the analysis service directly; it goes
//! through an [`Invoker`]. Errors carry enough signal for the retry policy to
//! classify them as transient, rate limited or permanent.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub mod http;

pub use http::{ApiCredentials, HttpInvoker, HttpInvokerBuilder, SetupError};

/// Invoker errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvokeError {
    /// The call did not complete within its timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Explicit quota rejection from the service
    #[error("quota exceeded: {message}")]
    RateLimited {
        /// Server-directed delay before the next attempt
        retry_after: Option<Duration>,
        /// Error text returned by the service
        message: String,
    },

    /// Server-side failure
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error text returned by the service
        message: String,
    },

    /// The service refused the request as invalid
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Error text returned by the service
        message: String,
    },

    /// The request payload could not be built
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl InvokeError {
    /// Server-directed delay, if the service sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            InvokeError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for invoker operations
pub type InvokeResult<T> = Result<T, InvokeError>;

/// Successful response of one external call
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponse {
    /// Response body
    pub body: Value,
    /// Cost units actually charged, when the service reports them
    pub cost_units: Option<u64>,
    /// The body could not be interpreted and is kept verbatim
    pub degraded: bool,
}

impl InvokeResponse {
    /// A well-formed response
    pub fn new(body: Value, cost_units: Option<u64>) -> Self {
        Self {
            body,
            cost_units,
            degraded: false,
        }
    }

    /// A response kept verbatim because it could not be parsed
    pub fn degraded(raw: impl Into<String>, cost_units: Option<u64>) -> Self {
        Self {
            body: Value::String(raw.into()),
            cost_units,
            degraded: true,
        }
    }
}

/// The external analysis call
///
/// Implementations must be safe to call repeatedly with the same payload: an
/// item completed after the last checkpoint flush is invoked again on resume.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Submit one payload
    async fn invoke(&self, payload: &Value) -> InvokeResult<InvokeResponse>;

    /// Pessimistic cost estimate reserved before the call.
    /// `None` falls back to the configured default.
    fn estimate_cost(&self, _payload: &Value) -> Option<u64> {
        None
    }
}
