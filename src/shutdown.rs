//! Cooperative cancellation for dispatch runs.
//!
//! A [`ShutdownCoordinator`] is shared by the dispatcher, its workers and the
//! Ctrl+C handler. Once shutdown is requested no new external call is
//! admitted, backoff sleeps end early, and the dispatcher performs its final
//! checkpoint flush before returning.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Handle cloned into the dispatcher, its workers and the Ctrl+C handler.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

static GLOBAL_SHUTDOWN: OnceCell<SharedShutdown> = OnceCell::new();

/// Register the handle that the Ctrl+C handler trips. Dispatchers built
/// afterwards pick it up without an explicit `with_shutdown`. Only the first
/// registration sticks.
pub fn set_global_shutdown(handle: SharedShutdown) {
    let _ = GLOBAL_SHUTDOWN.set(handle);
}

/// Handle a new [`Dispatcher`](crate::dispatcher::Dispatcher) starts with.
pub fn get_global_shutdown() -> Option<SharedShutdown> {
    GLOBAL_SHUTDOWN.get().cloned()
}

/// Cancellation flag plus a wakeup for workers parked in admission or in a
/// retry backoff.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    /// Coordinator with no shutdown requested.
    pub fn new() -> Self {
        Self {
            is_shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// [`Self::new`] behind an [`Arc`], ready to hand to a dispatcher.
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Stop admitting calls. Workers waiting for admission or backoff wake
    /// once; calls already in flight run to completion. Repeated requests
    /// are no-ops.
    pub fn request_shutdown(&self) {
        if !self.is_shutdown.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Checked before each admission and when a run ends, to mark it interrupted.
    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown is requested, immediately if it already was.
    /// Raced against admission waits and backoff sleeps.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a request between the two is not lost
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}
