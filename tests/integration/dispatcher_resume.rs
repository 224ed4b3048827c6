//! Resuming a run from its checkpoint

use analysis_dispatch::checkpoint::{CheckpointBackend, CheckpointStore, FileBackend, MemoryBackend};
use analysis_dispatch::cli::{Cli, Commands, RunArgs};
use analysis_dispatch::dispatcher::{DispatchSummary, Dispatcher};
use analysis_dispatch::shutdown::ShutdownCoordinator;
use analysis_dispatch::source;
use clap::Parser;
use analysis_dispatch::{ItemStatus, WorkItem};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use crate::support::{self, ScriptedInvoker};

fn batch() -> Vec<WorkItem> {
    (0..10)
        .map(|i| {
            let id = format!("review-{i}");
            if i == 3 || i == 7 {
                // Rejected on the first run only
                support::item(&id, json!({"fail": "permanent", "fail_times": 1}))
            } else {
                support::item(&id, json!({}))
            }
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_successes_and_retries_failures() {
    let backend = MemoryBackend::new();
    let invoker = Arc::new(ScriptedInvoker::new());

    let first = {
        let store = CheckpointStore::load(Box::new(backend.clone())).unwrap();
        Dispatcher::new(invoker.clone(), Arc::new(store), support::config())
            .unwrap()
            .with_shutdown(ShutdownCoordinator::shared())
            .run(batch())
            .await
            .unwrap()
    };
    assert_eq!(first.succeeded, 8);
    assert_eq!(first.failed, 2);
    assert!(first.archived_to.is_none());
    let stored = backend.stored().unwrap();
    assert_eq!(stored.get("review-3").unwrap().status(), ItemStatus::Failed);
    assert_eq!(invoker.calls(), 10);

    let store = CheckpointStore::load(Box::new(backend.clone())).unwrap();
    assert_eq!(store.skippable(), 8);
    let second = Dispatcher::new(invoker.clone(), Arc::new(store), support::config())
        .unwrap()
        .with_shutdown(ShutdownCoordinator::shared())
        .run(batch())
        .await
        .unwrap();

    assert_eq!(second.skipped, 8);
    assert_eq!(second.processed, 2);
    assert_eq!(second.succeeded, 2);
    assert_eq!(invoker.calls(), 12);
    assert_eq!(invoker.attempts_for("review-0"), 1);

    // The failure was replaced by the later success and the run archived
    let archived = backend.archived().unwrap();
    assert_eq!(archived.succeeded(), 10);
    assert_eq!(archived.get("review-7").unwrap().status(), ItemStatus::Succeeded);
    assert_eq!(archived.metadata().runs, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_store_ignores_existing_checkpoint() {
    let backend = MemoryBackend::new();
    let invoker = Arc::new(ScriptedInvoker::new());

    for _ in 0..2 {
        let store = CheckpointStore::fresh(Box::new(backend.clone()));
        let summary = Dispatcher::new(invoker.clone(), Arc::new(store), support::config())
            .unwrap()
            .with_shutdown(ShutdownCoordinator::shared())
            .run(support::items(5))
            .await
            .unwrap();
        assert_eq!(summary.skipped, 0);
    }
    assert_eq!(invoker.calls(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_file_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.json");
    let config = analysis_dispatch::dispatcher::DispatchConfig {
        concurrency: 1,
        ..support::config()
    };

    let shutdown = ShutdownCoordinator::shared();
    let invoker = Arc::new(ScriptedInvoker::new().shutdown_at(2, shutdown.clone()));
    let store = CheckpointStore::load(Box::new(FileBackend::new(&path))).unwrap();
    let summary = Dispatcher::new(invoker, Arc::new(store), config.clone())
        .unwrap()
        .with_shutdown(shutdown)
        .run(support::items(5))
        .await
        .unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.processed, 2);
    assert!(path.exists());

    let on_disk = FileBackend::new(&path).load().unwrap().unwrap();
    assert_eq!(on_disk.len(), 2);
    assert_eq!(on_disk.cursor().processed, 2);

    let invoker = Arc::new(ScriptedInvoker::new());
    let store = CheckpointStore::load(Box::new(FileBackend::new(&path))).unwrap();
    let summary = Dispatcher::new(invoker.clone(), Arc::new(store), config)
        .unwrap()
        .with_shutdown(ShutdownCoordinator::shared())
        .run(support::items(5))
        .await
        .unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(invoker.calls(), 3);
    assert!(!path.exists());
    let archive = FileBackend::new(&path).archive_path();
    assert_eq!(summary.archived_to.as_deref(), Some(archive.to_str().unwrap()));
    assert!(archive.exists());
}

fn run_args(input: &std::path::Path, checkpoint: &std::path::Path, extra: &[&str]) -> RunArgs {
    let mut args = vec![
        "analysis-dispatch".to_string(),
        "run".to_string(),
        input.display().to_string(),
        "--checkpoint".to_string(),
        checkpoint.display().to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    match Cli::parse_from(args).command {
        Commands::Run(args) => args,
        other => panic!("Expected run command, got {:?}", other),
    }
}

async fn run_from_file(args: &RunArgs, invoker: Arc<ScriptedInvoker>) -> DispatchSummary {
    let batch = source::load_batch(&args.input, &args.source_options()).unwrap();
    let config = args.dispatch_config_for(&batch);
    let store = CheckpointStore::load(Box::new(FileBackend::new(&args.checkpoint))).unwrap();
    Dispatcher::new(invoker, Arc::new(store), config)
        .unwrap()
        .with_shutdown(ShutdownCoordinator::shared())
        .run(batch.items)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_limited_run_keeps_checkpoint_for_full_run() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("reviews.jsonl");
    std::fs::write(
        &input,
        "{\"id\": \"r1\"}\n{\"id\": \"r2\"}\n{\"id\": \"r3\"}\n{\"id\": \"r4\"}\n",
    )
    .unwrap();
    let checkpoint = dir.path().join("run.json");
    let invoker = Arc::new(ScriptedInvoker::new());

    let limited = run_args(&input, &checkpoint, &["--limit", "2"]);
    let smoke = run_from_file(&limited, invoker.clone()).await;
    assert_eq!(smoke.succeeded, 2);
    assert!(smoke.archived_to.is_none());
    assert!(checkpoint.exists());

    let full = run_from_file(&run_args(&input, &checkpoint, &[]), invoker.clone()).await;
    assert_eq!(full.skipped, 2);
    assert_eq!(full.succeeded, 2);
    assert_eq!(invoker.calls(), 4);
    assert_eq!(invoker.attempts_for("r1"), 1);
    assert!(full.archived_to.is_some());
    assert!(!checkpoint.exists());
}
