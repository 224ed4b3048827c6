//! Periodic progress reporting for long dispatch runs.
//!
//! Computes completion percentage, throughput and an ETA from the number of
//! terminal results, and decides when the next `[PROGRESS]` line is due.

use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PERCENTAGE_STEP: f64 = 10.0;

/// Progress of the items processed in the current run.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Terminal results produced so far in this run.
    pub processed: u64,
    /// Successes among them.
    pub succeeded: u64,
    /// Failures among them.
    pub failed: u64,
    /// Items this run has to process (skipped items excluded).
    pub total: u64,
    /// When the run started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between time-based updates.
    pub update_interval: Duration,
    /// Current throughput (items per second).
    pub current_rate: f64,
    /// Last reported completion percentage (0-100).
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
}

impl ProgressState {
    /// Create a tracker for `total` items with default cadence.
    pub fn new(total: u64) -> Self {
        let now = Instant::now();
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            total,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            current_rate: 0.0,
            last_reported_percentage: 0.0,
            min_percentage_step: DEFAULT_PERCENTAGE_STEP,
        }
    }

    /// Count one terminal result.
    pub fn update(&mut self, success: bool) {
        self.processed = self.processed.saturating_add(1);
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_rate = self.processed as f64 / elapsed;
        }
    }

    /// Whether a progress line is due, by percentage step or elapsed time.
    pub fn should_emit_update(&self) -> bool {
        if self.processed == 0 {
            return false;
        }
        if self.percentage() - self.last_reported_percentage >= self.min_percentage_step {
            return true;
        }
        self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress line.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        self.last_reported_percentage = self.percentage();
    }

    /// Completion percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.processed as f64 / self.total as f64) * 100.0
    }

    /// Estimated time to finish at the current throughput.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        if self.current_rate <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.processed);
        if remaining == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.current_rate))
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] Processed {}/{} items - {:.1}% complete ({} failed)",
            self.processed,
            self.total,
            self.percentage(),
            self.failed
        )];

        if self.current_rate > 0.0 {
            parts.push(format!("at {:.2} items/sec", self.current_rate));
        }

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
