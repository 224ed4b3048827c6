//! Dual-quota admission control
//!
//! Composes two [`RateWindow`]s (call count and cost units) behind a single
//! mutex. A caller asks for permission before every external call attempt and
//! is suspended until both windows have room; the admission is committed to
//! both windows atomically under the lock.
//!
//! # Cost discipline
//!
//! The cost of a call is often only known after it completes. `acquire`
//! reserves the pessimistic estimate in the cost window and returns a
//! [`Reservation`]; once a call succeeds, [`AdmissionController::settle`]
//! replaces the reserved cost with the observed cost *in place*, keeping the
//! original timestamp. Nothing else records cost, so there is no double
//! counting. Failed calls keep their reservation.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::rate_window::{EntryId, RateWindow};
use crate::metrics::AdmissionMetrics;

/// Consecutive quota rejections before the effective ceilings are tightened
pub const RATE_LIMIT_TIGHTEN_AFTER: u32 = 3;

/// Multiplier applied to the effective ceilings on each tightening step
const TIGHTEN_STEP: f64 = 0.75;

/// Lowest tightening factor
const MIN_TIGHTEN_FACTOR: f64 = 0.25;

/// Quota shape enforced by an [`AdmissionController`]
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionLimits {
    /// Maximum calls per window
    pub count_ceiling: u64,
    /// Maximum cost units per window
    pub cost_ceiling: u64,
    /// Sliding window length
    pub window: Duration,
    /// Fraction of each ceiling kept in reserve
    pub headroom: f64,
    /// Margin added to every computed wait
    pub wait_slack: Duration,
}

impl AdmissionLimits {
    /// Limits with no headroom and no wait slack
    pub fn new(count_ceiling: u64, cost_ceiling: u64, window: Duration) -> Self {
        Self {
            count_ceiling,
            cost_ceiling,
            window,
            headroom: 0.0,
            wait_slack: Duration::ZERO,
        }
    }

    /// Set the fractional headroom
    pub fn with_headroom(mut self, headroom: f64) -> Self {
        self.headroom = headroom;
        self
    }

    /// Set the wait slack
    pub fn with_wait_slack(mut self, wait_slack: Duration) -> Self {
        self.wait_slack = wait_slack;
        self
    }

    fn scaled(ceiling: u64, factor: f64) -> u64 {
        // Epsilon keeps exact products like 100 * 0.29 from flooring one unit low
        ((ceiling as f64 * factor + 1e-9).floor() as u64).clamp(1, ceiling.max(1))
    }

    fn base_factor(&self) -> f64 {
        1.0 - self.headroom
    }

    /// Ceilings after headroom, before any tightening
    pub fn base_ceilings(&self) -> (u64, u64) {
        (
            Self::scaled(self.count_ceiling, self.base_factor()),
            Self::scaled(self.cost_ceiling, self.base_factor()),
        )
    }
}

/// Errors raised by admission control
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// A single call costs more than the cost window can ever hold
    #[error("call cost {cost} exceeds the cost ceiling of {ceiling} per window")]
    CostExceedsCeiling {
        /// Requested cost
        cost: u64,
        /// Effective cost ceiling
        ceiling: u64,
    },
}

/// A committed admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    cost_entry: EntryId,
    estimated_cost: u64,
    admitted_at: Instant,
    waited: Duration,
}

impl Reservation {
    /// Cost reserved at admission time
    pub fn estimated_cost(&self) -> u64 {
        self.estimated_cost
    }

    /// When the admission was committed
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Time spent waiting for admission
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Point-in-time view of both windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionUsage {
    /// Calls in the current window
    pub requests: u64,
    /// Cost units in the current window
    pub cost: u64,
    /// Effective call ceiling
    pub request_ceiling: u64,
    /// Effective cost ceiling
    pub cost_ceiling: u64,
}

#[derive(Debug)]
struct Throttle {
    factor: f64,
    consecutive_rate_limited: u32,
    tightened_at: Option<Instant>,
}

impl Throttle {
    fn new() -> Self {
        Self {
            factor: 1.0,
            consecutive_rate_limited: 0,
            tightened_at: None,
        }
    }

    /// Step back toward full capacity once a whole window passed quietly
    fn relax(&mut self, now: Instant, window: Duration) {
        if let Some(at) = self.tightened_at {
            if now.saturating_duration_since(at) >= window {
                self.factor = (self.factor / TIGHTEN_STEP).min(1.0);
                self.tightened_at = if self.factor < 1.0 { Some(now) } else { None };
                AdmissionMetrics::update_ceiling_factor(self.factor);
                info!(factor = self.factor, "Relaxed admission ceilings");
            }
        }
    }

    fn remaining_cooldown(&self, now: Instant, window: Duration) -> Option<Duration> {
        self.tightened_at
            .map(|at| window.saturating_sub(now.saturating_duration_since(at)))
    }
}

#[derive(Debug)]
struct AdmissionState {
    count: RateWindow,
    cost: RateWindow,
    throttle: Throttle,
}

impl AdmissionState {
    fn ceilings(&self, limits: &AdmissionLimits) -> (u64, u64) {
        let factor = limits.base_factor() * self.throttle.factor;
        (
            AdmissionLimits::scaled(limits.count_ceiling, factor),
            AdmissionLimits::scaled(limits.cost_ceiling, factor),
        )
    }
}

/// Gate shared by every worker; no external call may bypass it
#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    /// Create a controller with empty windows
    pub fn new(limits: AdmissionLimits) -> Self {
        let state = AdmissionState {
            count: RateWindow::new(limits.window),
            cost: RateWindow::new(limits.window),
            throttle: Throttle::new(),
        };
        Self {
            limits,
            state: Mutex::new(state),
        }
    }

    /// Configured limits
    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Suspend until one call of `cost` fits under both ceilings, then commit it.
    ///
    /// The future can be dropped at any suspension point without side effects;
    /// windows are only mutated while the lock is held.
    pub async fn acquire(&self, cost: u64) -> Result<Reservation, AdmissionError> {
        let (_, base_cost_ceiling) = self.limits.base_ceilings();
        if cost > base_cost_ceiling {
            return Err(AdmissionError::CostExceedsCeiling {
                cost,
                ceiling: base_cost_ceiling,
            });
        }

        let started = Instant::now();

        loop {
            let wait = match self.try_admit(cost, started) {
                Ok(reservation) => {
                    AdmissionMetrics::record_acquired(cost, reservation.waited);
                    return Ok(reservation);
                }
                Err(wait) => wait,
            };
            debug!(
                cost = cost,
                wait_ms = wait.as_millis() as u64,
                "Admission blocked, waiting for window to drain"
            );
            sleep(wait).await;
        }
    }

    /// Admit immediately or return how long to wait before re-checking
    fn try_admit(&self, cost: u64, started: Instant) -> Result<Reservation, Duration> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        state.throttle.relax(now, self.limits.window);

        let (count_ceiling, cost_ceiling) = state.ceilings(&self.limits);
        let count_total = state.count.total(now);
        let cost_total = state.cost.total(now);

        let count_blocked = count_total + 1 > count_ceiling;
        let cost_blocked = cost_total.saturating_add(cost) > cost_ceiling;

        if !count_blocked && !cost_blocked {
            state.count.record(1, now);
            let cost_entry = state.cost.record(cost, now);
            AdmissionMetrics::update_usage(count_total + 1, cost_total + cost);
            return Ok(Reservation {
                cost_entry,
                estimated_cost: cost,
                admitted_at: now,
                waited: now.saturating_duration_since(started),
            });
        }

        // Wait for whichever blocked window drains last. A window that is
        // blocked while empty can only be blocked by tightening.
        let mut wait = Duration::ZERO;
        for (blocked, window) in [
            (count_blocked, &mut state.count),
            (cost_blocked, &mut state.cost),
        ] {
            if blocked {
                let until = window.time_until_expiry(now).unwrap_or(Duration::ZERO);
                wait = wait.max(until);
            }
        }
        if wait.is_zero() {
            wait = state
                .throttle
                .remaining_cooldown(now, self.limits.window)
                .unwrap_or(self.limits.window);
        }
        Err(wait + self.limits.wait_slack)
    }

    /// Replace a reservation's estimated cost with the observed cost
    pub fn settle(&self, reservation: &Reservation, actual_cost: u64) {
        if actual_cost == reservation.estimated_cost {
            return;
        }
        let mut state = self.state.lock();
        if !state.cost.amend(reservation.cost_entry, actual_cost) {
            debug!(
                estimated = reservation.estimated_cost,
                actual = actual_cost,
                "Reservation already left the window, skipping cost correction"
            );
        }
    }

    /// Register an explicit quota rejection from the service.
    ///
    /// Repeated rejections mean the configured ceilings are above what the
    /// service actually allows, so the effective ceilings shrink for a while.
    pub fn report_rate_limited(&self) {
        let mut state = self.state.lock();
        let throttle = &mut state.throttle;
        throttle.consecutive_rate_limited += 1;
        if throttle.consecutive_rate_limited >= RATE_LIMIT_TIGHTEN_AFTER {
            throttle.consecutive_rate_limited = 0;
            throttle.factor = (throttle.factor * TIGHTEN_STEP).max(MIN_TIGHTEN_FACTOR);
            throttle.tightened_at = Some(Instant::now());
            let factor = throttle.factor;
            AdmissionMetrics::update_ceiling_factor(factor);
            let (count_ceiling, cost_ceiling) = state.ceilings(&self.limits);
            warn!(
                factor = factor,
                count_ceiling = count_ceiling,
                cost_ceiling = cost_ceiling,
                "Repeated quota rejections - tightening admission ceilings"
            );
        }
    }

    /// Register a successful call; clears the rejection streak
    pub fn report_success(&self) {
        self.state.lock().throttle.consecutive_rate_limited = 0;
    }

    /// Current usage and effective ceilings
    pub fn usage(&self) -> AdmissionUsage {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (request_ceiling, cost_ceiling) = state.ceilings(&self.limits);
        AdmissionUsage {
            requests: state.count.total(now),
            cost: state.cost.total(now),
            request_ceiling,
            cost_ceiling,
        }
    }
}
