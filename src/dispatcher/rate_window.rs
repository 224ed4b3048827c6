//! Sliding-window accounting for call count or accumulated cost

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Handle to an entry recorded in a [`RateWindow`], used to amend its cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

#[derive(Debug, Clone)]
struct Entry {
    id: EntryId,
    at: Instant,
    cost: u64,
}

/// Ordered sequence of `(timestamp, cost)` pairs within a trailing duration.
///
/// Entries whose age is at least the window duration are evicted before every
/// read, so `total(now)` only ever sums entries with `now - timestamp < duration`.
/// Time is passed in explicitly; the window itself never reads a clock.
#[derive(Debug, Clone)]
pub struct RateWindow {
    duration: Duration,
    entries: VecDeque<Entry>,
    sum: u64,
    next_id: u64,
}

impl RateWindow {
    /// Create an empty window
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            entries: VecDeque::new(),
            sum: 0,
            next_id: 0,
        }
    }

    /// Window duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Append an entry. Timestamps are expected to be non-decreasing.
    pub fn record(&mut self, cost: u64, at: Instant) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push_back(Entry { id, at, cost });
        self.sum = self.sum.saturating_add(cost);
        id
    }

    /// Evict expired entries, then return the sum of the surviving costs
    pub fn total(&mut self, now: Instant) -> u64 {
        self.purge(now);
        self.sum
    }

    /// Timestamp of the earliest surviving entry
    pub fn oldest(&mut self, now: Instant) -> Option<Instant> {
        self.purge(now);
        self.entries.front().map(|e| e.at)
    }

    /// Time until the earliest surviving entry leaves the window
    pub fn time_until_expiry(&mut self, now: Instant) -> Option<Duration> {
        self.oldest(now)
            .map(|at| self.duration.saturating_sub(now.saturating_duration_since(at)))
    }

    /// Replace the cost of a still-live entry. Returns `false` if the entry
    /// already left the window.
    pub fn amend(&mut self, id: EntryId, cost: u64) -> bool {
        // Ids are assigned in push order, so the deque is sorted by id.
        match self.entries.binary_search_by_key(&id, |e| e.id) {
            Ok(index) => {
                let entry = &mut self.entries[index];
                self.sum = self.sum.saturating_sub(entry.cost).saturating_add(cost);
                entry.cost = cost;
                true
            }
            Err(_) => false,
        }
    }

    /// Number of live entries (after the last purge)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the window holds no entries (after the last purge)
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) < self.duration {
                break;
            }
            self.sum = self.sum.saturating_sub(front.cost);
            self.entries.pop_front();
        }
    }
}
