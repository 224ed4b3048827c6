//! Exit status and output of the `analysis-dispatch` binary

use assert_cmd::Command;
use std::path::Path;
use tempfile::TempDir;

/// Nothing listens on port 1, so every call fails fast with a network error
const UNREACHABLE_ENDPOINT: &str = "http://127.0.0.1:1/analyze";

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("analysis-dispatch").unwrap();
    cmd.env_remove("ANALYSIS_ENDPOINT")
        .env_remove("ANALYSIS_API_KEY")
        .env_remove("RUST_LOG");
    cmd
}

fn write_input(dir: &Path, lines: &[&str]) -> std::path::PathBuf {
    let path = dir.join("items.jsonl");
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    let output = cli().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("status"));
}

#[test]
fn test_invalid_resume_mode_is_a_usage_error() {
    let output = cli()
        .args(["run", "items.jsonl", "--resume", "sideways"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid resume mode"));
}

#[test]
fn test_missing_api_key_is_fatal() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), &[r#"{"id": "a", "text": "hi"}"#]);

    let output = cli()
        .arg("run")
        .arg(&input)
        .args(["--endpoint", UNREACHABLE_ENDPOINT])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ANALYSIS_API_KEY"));
}

#[test]
fn test_empty_input_succeeds_and_archives() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), &[]);
    let checkpoint = dir.path().join("state").join("run.json");

    let output = cli()
        .arg("--output-format")
        .arg("json")
        .arg("run")
        .arg(&input)
        .arg("--checkpoint")
        .arg(&checkpoint)
        .args(["--endpoint", UNREACHABLE_ENDPOINT])
        .env("ANALYSIS_API_KEY", "test-key")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["run"]["total"], 0);
    assert!(dir.path().join("state").join("run.completed.json").exists());
}

#[test]
fn test_failed_items_give_partial_status_and_are_reported() {
    let dir = TempDir::new().unwrap();
    let input = write_input(
        dir.path(),
        &[r#"{"id": "a", "text": "one"}"#, r#"{"id": "b", "text": "two"}"#],
    );
    let checkpoint = dir.path().join("run.json");

    let output = cli()
        .arg("run")
        .arg(&input)
        .arg("--checkpoint")
        .arg(&checkpoint)
        .args(["--max-retries", "0", "--call-timeout-secs", "5"])
        .args(["--endpoint", UNREACHABLE_ENDPOINT])
        .env("ANALYSIS_API_KEY", "test-key")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(3));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 failed"));
    assert!(stdout.contains("transient"));
    // The secret never reaches the logs
    assert!(!String::from_utf8_lossy(&output.stderr).contains("test-key"));
    assert!(checkpoint.exists());

    let status = cli()
        .arg("status")
        .arg("--checkpoint")
        .arg(&checkpoint)
        .output()
        .unwrap();
    assert!(status.status.success());
    assert!(String::from_utf8_lossy(&status.stdout).contains("Results: 2 total, 0 succeeded, 2 failed"));
}

#[test]
fn test_status_without_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    let output = cli()
        .arg("status")
        .arg("--checkpoint")
        .arg(dir.path().join("missing.json"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
