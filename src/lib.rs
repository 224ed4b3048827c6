//! # Analysis Dispatch Library
//!
//! A rate-limited, checkpointed batch dispatcher for pushing large numbers of
//! work items through an external analysis service that enforces two quotas at
//! once: requests per window and cost units (e.g. tokens) per window.
//!
//! ## Features
//!
//! - **Dual-Quota Admission**: Sliding-window admission control over both call
//!   count and accumulated cost, with adaptive tightening on repeated quota
//!   rejections
//! - **Bounded Concurrency**: Fixed-size worker pool; the pool itself is the
//!   backpressure mechanism
//! - **Retry Policy**: Error classification (transient / rate limited /
//!   permanent) with capped exponential backoff and jitter
//! - **Resume Capability**: Periodic atomic checkpoints of every terminal
//!   result; a re-run skips items that already succeeded
//! - **Graceful Shutdown**: Ctrl+C stops admitting new calls, lets in-flight
//!   calls finish and forces a final checkpoint flush
//!
//! ## Quick Start
//!
//! ```no_run
//! use analysis_dispatch::checkpoint::{CheckpointStore, FileBackend};
//! use analysis_dispatch::dispatcher::{DispatchConfig, Dispatcher};
//! use analysis_dispatch::invoker::{ApiCredentials, HttpInvoker};
//! use analysis_dispatch::WorkItem;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = ApiCredentials::new("x-api-key", std::env::var("ANALYSIS_API_KEY")?)?;
//! let invoker = HttpInvoker::builder("https://analysis.example.com/v1/analyze", credentials)
//!     .build()?;
//!
//! let store = CheckpointStore::load(Box::new(FileBackend::new("./.checkpoint/run.json")))?;
//! let dispatcher = Dispatcher::new(Arc::new(invoker), Arc::new(store), DispatchConfig::default())?;
//!
//! let items = vec![WorkItem::new("review-1", serde_json::json!({"text": "Great app"}))];
//! let summary = dispatcher.run(items).await?;
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`dispatcher`] - Admission control, retry policy and the worker pool
//! - [`checkpoint`] - Durable progress record with atomic saves
//! - [`invoker`] - The external analysis call and its error taxonomy
//! - [`source`] - Loading work items from JSONL, JSON or CSV files
//! - [`report`] - Aggregation of terminal results into a final report
//! - [`metrics`] - Prometheus metrics
//! - [`shutdown`] - Cancellation shared across workers

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Checkpoint persistence and resume
pub mod checkpoint;

/// CLI command implementations
pub mod cli;

/// Admission control, retry and the worker pool
pub mod dispatcher;

/// External analysis call
pub mod invoker;

/// Production observability metrics
pub mod metrics;

/// Result aggregation
pub mod report;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Work item sources
pub mod source;

pub use dispatcher::ErrorKind;

/// Lifecycle state of a [`WorkItem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Not yet attempted
    #[default]
    Pending,
    /// Owned by a worker; at least one call attempt has started
    InFlight,
    /// Terminal: the external call succeeded
    Succeeded,
    /// Terminal: the item failed permanently or exhausted its retries
    Failed,
}

impl ItemStatus {
    /// Whether this status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Succeeded | ItemStatus::Failed)
    }
}

/// One unit of work submitted to the external service.
///
/// The `id` must be stable across process restarts so checkpoint lookups
/// stay valid. Terminal transitions consume the item, so an item can produce
/// at most one [`TaskResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    id: String,
    payload: Value,
    attempts: u32,
    status: ItemStatus,
}

impl WorkItem {
    /// Create a pending work item
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            attempts: 0,
            status: ItemStatus::Pending,
        }
    }

    /// Stable item identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opaque payload submitted to the external service
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Number of call attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current status
    pub fn status(&self) -> ItemStatus {
        self.status
    }

    /// Mark the start of a call attempt (`Pending -> InFlight`, or the
    /// `InFlight -> InFlight` retry loop). Returns the attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.status = ItemStatus::InFlight;
        self.attempts
    }

    /// Finish the item successfully
    pub fn succeed(mut self, response: Value, cost_units: u64, degraded: bool) -> TaskResult {
        self.status = ItemStatus::Succeeded;
        TaskResult::new(
            self.id,
            Outcome::Success {
                response,
                cost_units,
                degraded,
            },
            self.attempts,
        )
    }

    /// Finish the item as a permanent failure, preserving the error detail
    pub fn fail(mut self, kind: ErrorKind, error: impl Into<String>) -> TaskResult {
        self.status = ItemStatus::Failed;
        TaskResult::new(
            self.id,
            Outcome::PermanentFailure {
                kind,
                error: error.into(),
            },
            self.attempts,
        )
    }
}

/// Terminal outcome of a work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The external call succeeded
    Success {
        /// Response body returned by the service
        response: Value,
        /// Cost units charged for the successful call
        cost_units: u64,
        /// The response could not be interpreted and was kept verbatim
        #[serde(default)]
        degraded: bool,
    },
    /// No retry left or the error was not retryable
    PermanentFailure {
        /// Classification of the last error
        kind: ErrorKind,
        /// Last error message
        error: String,
    },
}

/// Immutable record of a work item's terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    item_id: String,
    #[serde(flatten)]
    outcome: Outcome,
    attempts_used: u32,
    completed_at: DateTime<Utc>,
}

impl TaskResult {
    fn new(item_id: String, outcome: Outcome, attempts_used: u32) -> Self {
        Self {
            item_id,
            outcome,
            attempts_used,
            completed_at: Utc::now(),
        }
    }

    /// Identifier of the item this result belongs to
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Terminal outcome
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Number of call attempts that were made
    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    /// When the result was produced
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// Whether the outcome is a success
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Terminal status corresponding to the outcome
    pub fn status(&self) -> ItemStatus {
        if self.is_success() {
            ItemStatus::Succeeded
        } else {
            ItemStatus::Failed
        }
    }
}
