//! Aggregation of terminal results into a final report

use serde::Serialize;
use std::collections::BTreeMap;

use crate::{ErrorKind, Outcome, TaskResult};

/// Failure samples kept per classification
const MAX_FAILURE_SAMPLES: usize = 3;

/// Failures sharing one classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureGroup {
    /// Number of failed items
    pub count: usize,
    /// A few `(item_id, error)` pairs for the report
    pub samples: Vec<FailureSample>,
}

/// One failed item shown in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSample {
    /// Item id
    pub item_id: String,
    /// Last error message
    pub error: String,
}

/// Summary statistics over a results map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Results considered
    pub total: usize,
    /// Successful results
    pub succeeded: usize,
    /// Failed results
    pub failed: usize,
    /// Successes whose response was kept verbatim
    pub degraded: usize,
    /// Call attempts across all results
    pub attempts: u64,
    /// Cost units charged by successful calls
    pub cost_units: u64,
    /// Failures grouped by classification
    pub failures_by_kind: BTreeMap<ErrorKind, FailureGroup>,
}

impl Summary {
    /// Fraction of results that succeeded (1.0 for an empty run)
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total as f64
    }
}

/// Results partitioned by outcome plus summary counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate<'a> {
    /// Successful results, ordered by item id
    pub succeeded: Vec<&'a TaskResult>,
    /// Failed results, ordered by item id
    pub failed: Vec<&'a TaskResult>,
    /// Summary statistics
    pub summary: Summary,
}

/// Partition a results map and compute its summary. Pure.
pub fn aggregate(results: &BTreeMap<String, TaskResult>) -> Aggregate<'_> {
    let mut aggregate = Aggregate::default();
    let summary = &mut aggregate.summary;

    for result in results.values() {
        summary.total += 1;
        summary.attempts += u64::from(result.attempts_used());
        match result.outcome() {
            Outcome::Success {
                cost_units,
                degraded,
                ..
            } => {
                summary.succeeded += 1;
                summary.cost_units += cost_units;
                if *degraded {
                    summary.degraded += 1;
                }
                aggregate.succeeded.push(result);
            }
            Outcome::PermanentFailure { kind, error } => {
                summary.failed += 1;
                let group = summary.failures_by_kind.entry(*kind).or_default();
                group.count += 1;
                if group.samples.len() < MAX_FAILURE_SAMPLES {
                    group.samples.push(FailureSample {
                        item_id: result.item_id().to_string(),
                        error: error.clone(),
                    });
                }
                aggregate.failed.push(result);
            }
        }
    }
    aggregate
}
