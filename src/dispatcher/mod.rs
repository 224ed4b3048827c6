//! Dispatch orchestration and admission control
//!
//! # Overview
//!
//! The dispatcher pushes a finite batch of work items through the external
//! analysis call:
//!
//! 1. **Skip on resume**: items that already succeeded in the loaded
//!    checkpoint are never submitted again
//! 2. **Admission**: every call attempt passes through
//!    [`admission::AdmissionController`], which enforces a request ceiling and
//!    a cost ceiling over the same sliding window
//! 3. **Retry**: failures are classified by [`retry::RetryPolicy`] and retried
//!    with capped exponential backoff; every retry re-acquires admission
//! 4. **Checkpointing**: terminal results are recorded in the
//!    [`crate::checkpoint::CheckpointStore`] and flushed every
//!    `flush_interval` results
//!
//! # Components
//!
//! - [`executor`] - The worker pool ([`Dispatcher`])
//! - [`admission`] - Dual-quota admission controller
//! - [`rate_window`] - Sliding-window accounting
//! - [`retry`] - Error classification and backoff
//! - [`config`] - Configuration and default constants
//! - [`progress`] - Progress/ETA reporting
//!
//! # Error Handling
//!
//! Per-item errors never abort a run; they become failed [`crate::TaskResult`]s.
//! Only configuration errors and checkpoint persistence failures surface as
//! [`DispatchError`].

pub mod admission;
pub mod config;
pub mod executor;
pub mod progress;
pub mod rate_window;
pub mod retry;

pub use admission::{AdmissionController, AdmissionError, AdmissionLimits, AdmissionUsage, Reservation};
pub use config::DispatchConfig;
pub use executor::{DispatchSummary, Dispatcher};
pub use rate_window::RateWindow;
pub use retry::{ErrorKind, RetryContext, RetryPolicy};

use crate::checkpoint::CheckpointError;

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The same item id appears twice in one batch
    #[error("duplicate item id: {0}")]
    DuplicateItem(String),

    /// Checkpoint could not be persisted; the run was aborted
    #[error("checkpoint persistence failed: {0}")]
    Persistence(#[from] CheckpointError),
}
