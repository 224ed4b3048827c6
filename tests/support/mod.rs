//! Shared helpers for dispatcher integration tests

#![allow(dead_code)]

use analysis_dispatch::invoker::{InvokeError, InvokeResponse, InvokeResult, Invoker};
use analysis_dispatch::shutdown::SharedShutdown;
use analysis_dispatch::dispatcher::DispatchConfig;
use analysis_dispatch::WorkItem;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Invoker whose behaviour is driven by each item's payload.
///
/// Payload fields understood:
/// - `id`: key for per-item attempt counting
/// - `fail`: `"transient"`, `"rate_limited"` or `"permanent"`
/// - `fail_times`: how many attempts fail before success (default: all)
/// - `retry_after_ms`: `Retry-After` hint sent with `rate_limited`
/// - `cost`: reported cost units (default 10)
#[derive(Default)]
pub struct ScriptedInvoker {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    attempts: Mutex<HashMap<String, u64>>,
    call_times: Mutex<Vec<Instant>>,
    latency: Duration,
    shutdown_at: Option<(usize, SharedShutdown)>,
    hang_after: Option<usize>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Request shutdown while serving the `n`-th call (1-based)
    pub fn shutdown_at(mut self, n: usize, shutdown: SharedShutdown) -> Self {
        self.shutdown_at = Some((n, shutdown));
        self
    }

    /// Calls after the `n`-th never return
    pub fn hang_after(mut self, n: usize) -> Self {
        self.hang_after = Some(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, id: &str) -> u64 {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    fn outcome(&self, payload: &Value) -> InvokeResult<InvokeResponse> {
        let id = payload["id"].as_str().unwrap_or_default().to_string();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if let Some(kind) = payload["fail"].as_str() {
            let fail_times = payload["fail_times"].as_u64().unwrap_or(u64::MAX);
            if attempt <= fail_times {
                return Err(match kind {
                    "transient" => InvokeError::Server {
                        status: 503,
                        message: "overloaded".into(),
                    },
                    "rate_limited" => InvokeError::RateLimited {
                        retry_after: payload["retry_after_ms"].as_u64().map(Duration::from_millis),
                        message: "rate limit exceeded".into(),
                    },
                    _ => InvokeError::Rejected {
                        status: 400,
                        message: "invalid request".into(),
                    },
                });
            }
        }

        let cost = payload["cost"].as_u64().unwrap_or(10);
        Ok(InvokeResponse::new(json!({"id": id, "label": "positive"}), Some(cost)))
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&self, payload: &Value) -> InvokeResult<InvokeResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(Instant::now());
        if self.hang_after.is_some_and(|limit| n > limit) {
            std::future::pending::<()>().await;
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outcome = self.outcome(payload);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some((target, shutdown)) = &self.shutdown_at {
            if n == *target {
                shutdown.request_shutdown();
            }
        }
        outcome
    }
}

/// `n` plain items with ids `item-0000`, `item-0001`, ...
pub fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| item(&format!("item-{i:04}"), json!({}))).collect()
}

/// One item whose payload is `extra` plus its own id
pub fn item(id: &str, extra: Value) -> WorkItem {
    let mut payload = json!({"id": id});
    if let (Some(target), Value::Object(fields)) = (payload.as_object_mut(), extra) {
        target.extend(fields);
    }
    WorkItem::new(id, payload)
}

/// Fast, deterministic configuration with generous quotas
pub fn config() -> DispatchConfig {
    DispatchConfig {
        concurrency: 4,
        count_ceiling: 100_000,
        cost_ceiling: 10_000_000,
        wait_slack: Duration::ZERO,
        jitter: 0.0,
        ..DispatchConfig::default()
    }
}
