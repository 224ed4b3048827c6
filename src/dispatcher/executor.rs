//! Dispatcher: bounded-concurrency worker pool with admission, retry and
//! checkpointing

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use indicatif::ProgressBar;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::admission::{AdmissionController, AdmissionError, Reservation};
use super::config::DispatchConfig;
use super::progress::ProgressState;
use super::retry::{ErrorKind, RetryContext, RetryPolicy};
use super::DispatchError;
use crate::checkpoint::CheckpointStore;
use crate::invoker::{InvokeError, Invoker};
use crate::metrics::{self, CallMetrics};
use crate::shutdown::{self, SharedShutdown};
use crate::{TaskResult, WorkItem};

/// Outcome of one [`Dispatcher::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Items handed to the run
    pub total: usize,
    /// Items skipped because they already succeeded
    pub skipped: usize,
    /// Terminal results produced by this run
    pub processed: usize,
    /// Successes among them
    pub succeeded: usize,
    /// Failures among them
    pub failed: usize,
    /// Items left unfinished because shutdown was requested
    pub cancelled: usize,
    /// Whether shutdown was requested during the run
    pub interrupted: bool,
    /// Where the checkpoint lives
    pub checkpoint: String,
    /// Where the checkpoint was archived, if the run completed fully
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_to: Option<String>,
}

/// Worker pool driving work items through the external call.
///
/// Concurrency is bounded by `config.concurrency`: the pool never holds more
/// than that many items in flight, which is the only backpressure needed on
/// top of admission control.
pub struct Dispatcher {
    invoker: Arc<dyn Invoker>,
    store: Arc<CheckpointStore>,
    admission: Arc<AdmissionController>,
    policy: RetryPolicy,
    config: DispatchConfig,
    shutdown: Option<SharedShutdown>,
    progress_bar: Option<ProgressBar>,
    observer: Option<mpsc::UnboundedSender<TaskResult>>,
}

impl Dispatcher {
    /// Create a dispatcher with its own admission controller
    pub fn new(
        invoker: Arc<dyn Invoker>,
        store: Arc<CheckpointStore>,
        config: DispatchConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let admission = Arc::new(AdmissionController::new(config.admission_limits()));
        Ok(Self {
            invoker,
            store,
            admission,
            policy: config.retry_policy(),
            config,
            shutdown: shutdown::get_global_shutdown(),
            progress_bar: None,
            observer: None,
        })
    }

    /// Share an admission controller with other dispatchers hitting the same quota
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    /// Attach a shared shutdown handle for graceful cancellation.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Drive a progress bar as results come in
    pub fn with_progress_bar(mut self, progress_bar: ProgressBar) -> Self {
        self.progress_bar = Some(progress_bar);
        self
    }

    /// Stream every terminal result to `observer` as it is produced
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<TaskResult>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Admission controller gating this dispatcher
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Checkpoint store receiving the results
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Process every item not already completed, then flush the checkpoint.
    ///
    /// Returns an error only for duplicate ids or when the checkpoint cannot
    /// be persisted; in the latter case one best-effort flush is attempted
    /// before returning.
    pub async fn run(&self, items: Vec<WorkItem>) -> Result<DispatchSummary, DispatchError> {
        let span = info_span!(
            "dispatch_run",
            items = items.len(),
            concurrency = self.config.concurrency
        );
        self.run_inner(items).instrument(span).await
    }

    async fn run_inner(&self, items: Vec<WorkItem>) -> Result<DispatchSummary, DispatchError> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(item.id()) {
                return Err(DispatchError::DuplicateItem(item.id().to_string()));
            }
        }
        drop(seen);

        let mut summary = DispatchSummary {
            total: items.len(),
            checkpoint: self.store.location(),
            ..DispatchSummary::default()
        };

        let pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !self.store.should_skip(item.id()))
            .collect();
        summary.skipped = summary.total - pending.len();

        info!(
            total = summary.total,
            skipped = summary.skipped,
            pending = pending.len(),
            count_ceiling = self.admission.limits().count_ceiling,
            cost_ceiling = self.admission.limits().cost_ceiling,
            window_secs = self.admission.limits().window.as_secs_f64(),
            checkpoint = %summary.checkpoint,
            "Starting dispatch"
        );

        let mut progress = ProgressState::new(pending.len() as u64);
        if let Some(pb) = &self.progress_bar {
            pb.set_length(pending.len() as u64);
        }

        let mut results = stream::iter(pending)
            .map(|item| self.process_guarded(item))
            .buffer_unordered(self.config.concurrency);

        let mut fatal = None;
        while let Some(outcome) = results.next().await {
            let Some(result) = outcome else {
                summary.cancelled += 1;
                continue;
            };

            let success = result.is_success();
            summary.processed += 1;
            if success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            metrics::record_completion(success);

            if let Some(observer) = &self.observer {
                let _ = observer.send(result.clone());
            }

            let pending_flush = self.store.record(result);
            if pending_flush >= self.config.flush_interval {
                if let Err(e) = self.store.flush() {
                    error!(error = %e, "Checkpoint flush failed, aborting run");
                    fatal = Some(e);
                    break;
                }
            }

            progress.update(success);
            if let Some(pb) = &self.progress_bar {
                pb.inc(1);
            }
            if progress.should_emit_update() {
                info!("{}", progress.format_progress());
                progress.mark_emitted();
            }
        }
        drop(results);

        if let Some(e) = fatal {
            if let Err(retry_err) = self.store.flush() {
                warn!(error = %retry_err, "Best-effort final flush failed");
            }
            if let Some(pb) = &self.progress_bar {
                pb.abandon_with_message("aborted");
            }
            return Err(DispatchError::Persistence(e));
        }

        // Final flush runs on completion and on interruption alike
        self.store.flush()?;

        summary.interrupted = self.shutdown_requested();
        if let Some(pb) = &self.progress_bar {
            if summary.interrupted {
                pb.abandon_with_message("interrupted");
            } else {
                pb.finish_with_message("done");
            }
        }

        let complete = !summary.interrupted
            && summary.cancelled == 0
            && self.store.snapshot().failed() == 0;
        if complete && self.config.archive_on_success {
            summary.archived_to = self.store.finalize()?;
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            interrupted = summary.interrupted,
            "Dispatch finished"
        );
        Ok(summary)
    }

    /// Run one item, converting a worker panic into a failed result.
    ///
    /// Panics inside the call itself are caught in `process_item`, which
    /// keeps the attempt count; this guard covers everything around it.
    async fn process_guarded(&self, item: WorkItem) -> Option<TaskResult> {
        let item_id = item.id().to_string();
        match AssertUnwindSafe(self.process_item(item)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(item_id = %item_id, panic = %message, "Worker panicked");
                Some(WorkItem::new(item_id, serde_json::Value::Null).fail(
                    ErrorKind::Permanent,
                    format!("worker panicked: {message}"),
                ))
            }
        }
    }

    /// Drive one item to a terminal result. `None` means shutdown interrupted
    /// it before it reached one.
    async fn process_item(&self, mut item: WorkItem) -> Option<TaskResult> {
        let estimated = self
            .invoker
            .estimate_cost(item.payload())
            .unwrap_or(self.config.estimated_cost);
        let max_attempts = self.policy.max_retries + 1;
        let mut retry: u32 = 0;

        loop {
            if self.shutdown_requested() {
                debug!(item_id = %item.id(), "Shutdown requested, not admitting item");
                return None;
            }

            let reservation = match self.admit(estimated).await? {
                Ok(reservation) => reservation,
                Err(e) => {
                    warn!(item_id = %item.id(), error = %e, "Item can never be admitted");
                    return Some(item.fail(ErrorKind::Permanent, e.to_string()));
                }
            };

            let attempt = item.begin_attempt();
            let call = CallMetrics::start(attempt);
            let invocation = AssertUnwindSafe(self.invoker.invoke(item.payload())).catch_unwind();
            let outcome = match tokio::time::timeout(self.config.call_timeout, invocation).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    error!(item_id = %item.id(), attempt, panic = %message, "Invoker panicked");
                    call.record_failure(ErrorKind::Permanent);
                    return Some(item.fail(
                        ErrorKind::Permanent,
                        format!("worker panicked: {message}"),
                    ));
                }
                Err(_) => Err(InvokeError::Timeout(self.config.call_timeout)),
            };

            let err = match outcome {
                Ok(response) => {
                    let cost = response.cost_units.unwrap_or(estimated);
                    self.admission.settle(&reservation, cost);
                    self.admission.report_success();
                    call.record_success(cost);
                    if response.degraded {
                        warn!(item_id = %item.id(), "Response could not be parsed, kept verbatim");
                    }
                    if attempt > 1 {
                        info!(item_id = %item.id(), attempt, "Retry succeeded");
                    }
                    return Some(item.succeed(response.body, cost, response.degraded));
                }
                Err(err) => err,
            };

            let kind = self.policy.classify(&err);
            call.record_failure(kind);
            if kind == ErrorKind::RateLimited {
                self.admission.report_rate_limited();
            }
            let error_message = err.to_string();

            if !self.policy.should_retry(retry, kind) {
                let context = RetryContext {
                    item_id: item.id(),
                    attempt,
                    max_attempts,
                    kind,
                    backoff: Duration::ZERO,
                    error_message: &error_message,
                };
                warn!("{}", context.format_failure());
                return Some(item.fail(kind, error_message));
            }

            let backoff = self
                .policy
                .backoff(retry, kind)
                .max(err.retry_after().unwrap_or(Duration::ZERO));
            let context = RetryContext {
                item_id: item.id(),
                attempt: attempt + 1,
                max_attempts,
                kind,
                backoff,
                error_message: &error_message,
            };
            info!(error = %error_message, "{}", context.format_retry());
            metrics::record_retry_backoff(backoff, kind);

            if !self.sleep_unless_shutdown(backoff).await {
                debug!(item_id = %item.id(), "Shutdown during backoff, leaving item for resume");
                return None;
            }
            retry += 1;
        }
    }

    /// Wait for admission; `None` if shutdown was requested meanwhile
    async fn admit(&self, cost: u64) -> Option<Result<Reservation, AdmissionError>> {
        match &self.shutdown {
            Some(shutdown) => tokio::select! {
                reservation = self.admission.acquire(cost) => Some(reservation),
                _ = shutdown.wait_for_shutdown() => None,
            },
            None => Some(self.admission.acquire(cost).await),
        }
    }

    /// Sleep for `delay`; returns `false` if shutdown cut the sleep short
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(shutdown) => tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = shutdown.wait_for_shutdown() => false,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
