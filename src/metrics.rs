//! Production observability metrics for dispatch runs
//!
//! Tracks external call outcomes, retries, admission waits, window usage and
//! checkpoint flushes.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Prometheus exporter for the scrape endpoint (`--metrics-addr`)
//! - Recording is a no-op until [`init_metrics`] installs a recorder

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ErrorKind;

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: a second call is a no-op.
///
/// # Arguments
/// * `addr` - Socket address to bind the Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "analysis_calls_total",
        Unit::Count,
        "External analysis calls by result classification"
    );
    describe_histogram!(
        "analysis_call_duration_seconds",
        Unit::Seconds,
        "External analysis call duration in seconds"
    );
    describe_counter!(
        "analysis_cost_units_total",
        Unit::Count,
        "Cost units charged by successful calls"
    );
    describe_counter!(
        "dispatch_retries_total",
        Unit::Count,
        "Total number of retry attempts"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_counter!(
        "admission_acquired_total",
        Unit::Count,
        "Admissions granted by the admission controller"
    );
    describe_histogram!(
        "admission_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for admission"
    );
    describe_gauge!(
        "admission_window_requests",
        Unit::Count,
        "Calls in the current sliding window"
    );
    describe_gauge!(
        "admission_window_cost",
        Unit::Count,
        "Cost units in the current sliding window"
    );
    describe_gauge!(
        "admission_ceiling_factor",
        Unit::Count,
        "Current tightening factor applied to the admission ceilings"
    );
    describe_counter!(
        "dispatch_items_completed_total",
        Unit::Count,
        "Work items reaching a terminal state, by outcome"
    );
    describe_counter!(
        "checkpoint_flushes_total",
        Unit::Count,
        "Checkpoint flushes, by result"
    );
    describe_histogram!(
        "checkpoint_flush_duration_seconds",
        Unit::Seconds,
        "Checkpoint flush duration in seconds"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Admission controller metrics
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Record a granted admission and the time spent waiting for it
    pub fn record_acquired(cost: u64, waited: Duration) {
        counter!("admission_acquired_total").increment(1);
        histogram!("admission_wait_seconds").record(waited.as_secs_f64());

        if waited.as_millis() > 100 {
            debug!(
                cost = cost,
                wait_ms = waited.as_millis() as u64,
                "Admission granted after wait"
            );
        }
    }

    /// Update the window usage gauges
    pub fn update_usage(requests: u64, cost: u64) {
        gauge!("admission_window_requests").set(requests as f64);
        gauge!("admission_window_cost").set(cost as f64);
    }

    /// Update the tightening factor gauge
    pub fn update_ceiling_factor(factor: f64) {
        gauge!("admission_ceiling_factor").set(factor);
    }
}

/// Timing and outcome of one external call attempt
pub struct CallMetrics {
    start_time: Instant,
    attempt: u32,
}

impl CallMetrics {
    /// Start timing a call attempt
    pub fn start(attempt: u32) -> Self {
        Self {
            start_time: Instant::now(),
            attempt,
        }
    }

    /// Record a successful call
    pub fn record_success(&self, cost_units: u64) {
        counter!("analysis_calls_total", "result" => "success").increment(1);
        counter!("analysis_cost_units_total").increment(cost_units);
        histogram!("analysis_call_duration_seconds").record(self.start_time.elapsed().as_secs_f64());
    }

    /// Record a failed call
    pub fn record_failure(&self, kind: ErrorKind) {
        let duration = self.start_time.elapsed();
        counter!("analysis_calls_total", "result" => kind.to_string()).increment(1);
        histogram!("analysis_call_duration_seconds").record(duration.as_secs_f64());

        if kind == ErrorKind::RateLimited {
            warn!(
                attempt = self.attempt,
                duration_ms = duration.as_millis() as u64,
                "Quota rejection recorded"
            );
        }
    }
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, kind: ErrorKind) {
    counter!("dispatch_retries_total", "kind" => kind.to_string()).increment(1);
    histogram!(
        "retry_backoff_duration_seconds",
        "kind" => kind.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a work item reaching a terminal state
pub fn record_completion(success: bool) {
    let outcome = if success { "succeeded" } else { "failed" };
    counter!("dispatch_items_completed_total", "outcome" => outcome).increment(1);
}

/// Record a checkpoint flush
pub fn record_checkpoint_flush(duration: Duration, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("checkpoint_flushes_total", "result" => result).increment(1);
    histogram!("checkpoint_flush_duration_seconds").record(duration.as_secs_f64());
}
