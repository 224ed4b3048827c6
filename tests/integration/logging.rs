//! Integration tests for logging and retry messages

use analysis_dispatch::dispatcher::RetryContext;
use analysis_dispatch::invoker::ApiCredentials;
use analysis_dispatch::ErrorKind;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[test]
fn test_tracing_subscriber_initialization() {
    // Either succeeds or fails because already initialized (both are OK)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("analysis_dispatch=debug")),
        )
        .with_test_writer()
        .try_init();

    info!(items = 3, "Starting dispatch");
    warn!(item_id = "r-1", "Response could not be parsed, kept verbatim");
}

#[test]
fn test_env_filter_parsing() {
    let _ = EnvFilter::new("analysis_dispatch=info");
    let _ = EnvFilter::new("warn,analysis_dispatch::dispatcher=trace");
}

#[test]
fn test_retry_message_format() {
    let context = RetryContext {
        item_id: "r-7",
        attempt: 2,
        max_attempts: 6,
        kind: ErrorKind::RateLimited,
        backoff: Duration::from_secs(5),
        error_message: "quota exceeded: rate limit exceeded",
    };
    assert_eq!(
        context.format_retry(),
        "Retrying item r-7 (attempt 2/6) after quota exceeded - waiting 5.0 seconds..."
    );
}

#[test]
fn test_failure_message_carries_suggestion() {
    let context = RetryContext {
        item_id: "r-9",
        attempt: 6,
        max_attempts: 6,
        kind: ErrorKind::Transient,
        backoff: Duration::ZERO,
        error_message: "network error: connection reset",
    };
    let message = context.format_failure();
    assert!(message.starts_with("[FAILED] Item r-9 failed after 6 attempts (transient)"));
    assert!(message.contains("connection reset"));
    assert!(message.contains(ErrorKind::Transient.suggestion()));
}

#[test]
fn test_credentials_never_appear_in_debug_output() {
    let credentials = ApiCredentials::new("x-api-key", "sk-very-secret").unwrap();
    let rendered = format!("{credentials:?}");
    assert!(!rendered.contains("sk-very-secret"));
}
