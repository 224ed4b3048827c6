//! Final report rendering for the CLI

use serde_json::json;

use crate::checkpoint::Checkpoint;
use crate::dispatcher::DispatchSummary;
use crate::report::{Aggregate, Summary};

/// Print the run report as a single JSON line
pub fn output_json(run: &DispatchSummary, aggregate: &Aggregate<'_>) {
    let failed_items: Vec<&str> = aggregate.failed.iter().map(|r| r.item_id()).collect();
    let output = json!({
        "success": aggregate.summary.failed == 0 && !run.interrupted && run.cancelled == 0,
        "run": run,
        "report": aggregate.summary,
        "failed_items": failed_items,
    });
    println!("{output}");
}

/// Print the run report for a terminal
pub fn output_human(run: &DispatchSummary, aggregate: &Aggregate<'_>) {
    if run.interrupted {
        println!("\nRun interrupted - progress saved, re-run to resume.");
    } else {
        println!("\nRun completed.");
    }
    println!(
        "This run: {} processed ({} succeeded, {} failed), {} skipped, {} not started",
        run.processed, run.succeeded, run.failed, run.skipped, run.cancelled
    );
    print_summary(&aggregate.summary);
    match &run.archived_to {
        Some(archived) => println!("Checkpoint archived: {archived}"),
        None => println!("Checkpoint: {}", run.checkpoint),
    }
}

/// Print a checkpoint summary as a single JSON line
pub fn output_status_json(location: &str, checkpoint: &Checkpoint, summary: &Summary) {
    let output = json!({
        "checkpoint": location,
        "schema_version": checkpoint.schema_version(),
        "saved_at": checkpoint.saved_at(),
        "runs": checkpoint.metadata().runs,
        "report": summary,
    });
    println!("{output}");
}

/// Print a checkpoint summary for a terminal
pub fn output_status_human(location: &str, checkpoint: &Checkpoint, summary: &Summary) {
    println!("Checkpoint: {location}");
    match checkpoint.saved_at() {
        Some(saved_at) => println!(
            "Last saved: {} (run {})",
            saved_at.to_rfc3339(),
            checkpoint.metadata().runs
        ),
        None => println!("Last saved: never"),
    }
    print_summary(summary);
}

fn print_summary(summary: &Summary) {
    println!(
        "Results: {} total, {} succeeded, {} failed ({:.1}% success)",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.success_rate() * 100.0
    );
    if summary.degraded > 0 {
        println!("Degraded responses kept verbatim: {}", summary.degraded);
    }
    println!(
        "Attempts: {}, cost units: {}",
        summary.attempts, summary.cost_units
    );

    if summary.failures_by_kind.is_empty() {
        return;
    }
    println!("\nFailures by kind:");
    for (kind, group) in &summary.failures_by_kind {
        println!("  {kind}: {} item(s) - {}", group.count, kind.suggestion());
        for sample in &group.samples {
            println!("    {}: {}", sample.item_id, sample.error);
        }
    }
}
