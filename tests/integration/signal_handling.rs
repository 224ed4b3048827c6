use std::sync::Arc;
use std::time::Duration;

use analysis_dispatch::checkpoint::{CheckpointStore, MemoryBackend};
use analysis_dispatch::dispatcher::Dispatcher;
use analysis_dispatch::shutdown::ShutdownCoordinator;
use serde_json::json;

use crate::support::{self, ScriptedInvoker};

#[tokio::test]
async fn shutdown_notifies_waiters() {
    let shutdown = ShutdownCoordinator::shared();
    let waiter = {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            handle.wait_for_shutdown().await;
            true
        })
    };

    // Give the task time to start waiting
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.request_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok());
}

/// Shutdown requested before anyone waits must not be missed
#[tokio::test]
async fn shutdown_requested_before_wait_no_deadlock() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let handle = shutdown.clone();
    let waiter = tokio::spawn(async move {
        handle.wait_for_shutdown().await;
        true
    });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok(), "wait_for_shutdown() deadlocked despite shutdown already requested");
}

#[tokio::test]
async fn shutdown_concurrent_waiters_all_notified() {
    let shutdown = ShutdownCoordinator::shared();

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let handle = shutdown.clone();
        waiters.push(tokio::spawn(async move {
            handle.wait_for_shutdown().await;
        }));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(result.is_ok(), "A waiter was not notified of shutdown");
    }
}

#[tokio::test(start_paused = true)]
async fn run_after_shutdown_admits_nothing_but_still_flushes() {
    let backend = MemoryBackend::new();
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let invoker = Arc::new(ScriptedInvoker::new());
    let store = CheckpointStore::load(Box::new(backend.clone())).unwrap();
    let summary = Dispatcher::new(invoker.clone(), Arc::new(store), support::config())
        .unwrap()
        .with_shutdown(shutdown)
        .run(support::items(20))
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.cancelled, 20);
    assert_eq!(invoker.calls(), 0);
    assert!(backend.stored().is_some());
    assert!(backend.archived().is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cuts_backoff_short_and_leaves_item_pending() {
    let backend = MemoryBackend::new();
    let shutdown = ShutdownCoordinator::shared();
    let invoker = Arc::new(ScriptedInvoker::new().shutdown_at(1, shutdown.clone()));
    let store = CheckpointStore::load(Box::new(backend.clone())).unwrap();

    let started = tokio::time::Instant::now();
    let summary = Dispatcher::new(invoker.clone(), Arc::new(store), support::config())
        .unwrap()
        .with_shutdown(shutdown)
        .run(vec![support::item("slow", json!({"fail": "rate_limited", "retry_after_ms": 600_000}))])
        .await
        .unwrap();

    // The 10 minute Retry-After was never waited out
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(summary.interrupted);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(invoker.calls(), 1);
    assert!(backend.stored().unwrap().get("slow").is_none());
}

#[tokio::test(start_paused = true)]
async fn in_flight_calls_finish_after_shutdown() {
    let backend = MemoryBackend::new();
    let shutdown = ShutdownCoordinator::shared();
    let invoker = Arc::new(ScriptedInvoker::new().with_latency(Duration::from_millis(100)));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.request_shutdown();
        }
    });
    let store = CheckpointStore::load(Box::new(backend.clone())).unwrap();
    let summary = Dispatcher::new(invoker.clone(), Arc::new(store), support::config())
        .unwrap()
        .with_shutdown(shutdown)
        .run(support::items(10))
        .await
        .unwrap();

    // Four calls were already running when shutdown was requested
    assert_eq!(invoker.calls(), 4);
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.cancelled, 6);
    assert_eq!(backend.stored().unwrap().len(), 4);
}
