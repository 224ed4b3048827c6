//! Unit tests for CLI argument parsing

use analysis_dispatch::cli::{Cli, Commands, OutputFormat, ResumeMode};
use clap::Parser;
use std::str::FromStr;
use std::time::Duration;

fn run_args(extra: &[&str]) -> analysis_dispatch::cli::RunArgs {
    let mut args = vec!["analysis-dispatch", "run", "reviews.jsonl"];
    args.extend_from_slice(extra);
    match Cli::parse_from(args).command {
        Commands::Run(args) => args,
        other => panic!("Expected run command, got {:?}", other),
    }
}

#[test]
fn test_run_defaults() {
    let args = run_args(&[]);
    assert_eq!(args.resume, ResumeMode::On);
    assert_eq!(args.id_field, "id");
    assert_eq!(args.checkpoint.to_str(), Some(".checkpoint/dispatch.json"));
    assert!(!args.no_archive);

    let config = args.dispatch_config();
    assert_eq!(config.concurrency, 8);
    assert_eq!(config.count_ceiling, 50);
    assert_eq!(config.cost_ceiling, 40_000);
    assert_eq!(config.window, Duration::from_secs(60));
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.flush_interval, 100);
    assert!(config.archive_on_success);
    assert!(config.validate().is_ok());
}

#[test]
fn test_flags_map_onto_config() {
    let args = run_args(&[
        "--concurrency",
        "16",
        "--count-ceiling",
        "20",
        "--cost-ceiling",
        "5000",
        "--window-secs",
        "30",
        "--headroom",
        "0.1",
        "--max-retries",
        "0",
        "--flush-interval",
        "10",
        "--no-archive",
        "--header",
        "anthropic-version=2023-06-01",
    ]);
    let config = args.dispatch_config();
    assert_eq!(config.concurrency, 16);
    assert_eq!(config.count_ceiling, 20);
    assert_eq!(config.cost_ceiling, 5000);
    assert_eq!(config.window, Duration::from_secs(30));
    assert_eq!(config.headroom, 0.1);
    assert_eq!(config.max_retries, 0);
    assert_eq!(config.flush_interval, 10);
    assert!(!config.archive_on_success);
    assert_eq!(
        args.headers,
        vec![("anthropic-version".to_string(), "2023-06-01".to_string())]
    );
}

#[test]
fn test_out_of_range_values_rejected() {
    for bad in [
        vec!["--concurrency", "0"],
        vec!["--concurrency", "1000"],
        vec!["--max-retries", "21"],
        vec!["--headroom", "0.9"],
        vec!["--window-secs", "0"],
        vec!["--resume", "verify"],
    ] {
        let mut args = vec!["analysis-dispatch", "run", "reviews.jsonl"];
        args.extend(bad.iter().copied());
        assert!(Cli::try_parse_from(args.clone()).is_err(), "accepted {bad:?}");
    }
}

#[test]
fn test_resume_and_output_modes_parse() {
    assert_eq!(ResumeMode::from_str("RESET").unwrap(), ResumeMode::Reset);
    assert_eq!(ResumeMode::from_str("off").unwrap(), ResumeMode::Off);
    assert!(ResumeMode::from_str("maybe")
        .unwrap_err()
        .contains("Valid options: on, off, reset"));

    let cli = Cli::parse_from(["analysis-dispatch", "status", "--output-format", "json"]);
    assert_eq!(cli.output_format, OutputFormat::Json);
}

#[test]
fn test_api_key_hidden_from_debug() {
    let cli = Cli::parse_from([
        "analysis-dispatch",
        "run",
        "reviews.jsonl",
        "--api-key",
        "sk-live-123",
    ]);
    assert!(!format!("{cli:?}").contains("sk-live-123"));
}
