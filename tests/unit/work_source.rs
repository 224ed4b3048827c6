//! Unit tests for loading work items from files

use analysis_dispatch::source::{load_batch, load_items, SourceError, SourceOptions};
use serde_json::json;
use std::path::PathBuf;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_json_lines_skip_blank_lines() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "reviews.jsonl",
        "{\"id\": \"r1\", \"text\": \"great\"}\n\n{\"id\": 2, \"text\": \"bad\"}\n",
    );

    let items = load_items(&path, &SourceOptions::default()).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id(), "r1");
    assert_eq!(items[1].id(), "2");
    assert_eq!(items[1].payload()["text"], "bad");
}

#[test]
fn test_json_array_with_payload_field_and_limit() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "reviews.json",
        &json!([
            {"review_id": "a", "body": {"text": "one"}},
            {"review_id": "b", "body": {"text": "two"}},
            {"review_id": "c", "body": {"text": "three"}}
        ])
        .to_string(),
    );
    let options = SourceOptions {
        id_field: "review_id".into(),
        payload_field: Some("body".into()),
        limit: Some(2),
    };

    let items = load_items(&path, &options).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].payload(), &json!({"text": "two"}));
}

#[test]
fn test_csv_rows_become_string_fields() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "reviews.csv", "id,rating,text\nx1,5,\"love it, really\"\nx2,1,meh\n");

    let items = load_items(&path, &SourceOptions::default()).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[0].payload(),
        &json!({"id": "x1", "rating": "5", "text": "love it, really"})
    );
}

#[test]
fn test_load_errors() {
    let dir = TempDir::new().unwrap();
    let options = SourceOptions::default();

    let broken = write(&dir, "broken.jsonl", "{\"id\": \"a\"}\n{oops\n");
    assert!(matches!(
        load_items(&broken, &options),
        Err(SourceError::Parse { record: 2, .. })
    ));

    let duplicate = write(&dir, "dup.jsonl", "{\"id\": \"a\"}\n{\"id\": \"a\"}\n");
    assert!(matches!(
        load_items(&duplicate, &options),
        Err(SourceError::DuplicateId { .. })
    ));

    let text = write(&dir, "notes.txt", "hello");
    assert!(matches!(
        load_items(&text, &options),
        Err(SourceError::UnsupportedFormat(_))
    ));

    assert!(matches!(
        load_items(&dir.path().join("missing.jsonl"), &options),
        Err(SourceError::Io(_))
    ));
}

#[test]
fn test_json_lines_parse_error_names_the_line() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "gaps.jsonl", "{\"id\": \"a\"}\n\n\n{oops\n");

    match load_items(&path, &SourceOptions::default()) {
        Err(SourceError::Parse { record, .. }) => assert_eq!(record, 4),
        other => panic!("Expected Parse error, got {:?}", other),
    }
}

#[test]
fn test_limit_reports_truncation() {
    let dir = TempDir::new().unwrap();
    let jsonl = write(
        &dir,
        "reviews.jsonl",
        "{\"id\": \"a\"}\n{\"id\": \"b\"}\n{\"id\": \"c\"}\n\n",
    );
    let csv = write(&dir, "reviews.csv", "id,text\na,x\nb,y\n");
    let limited = |limit| SourceOptions {
        limit: Some(limit),
        ..SourceOptions::default()
    };

    let batch = load_batch(&jsonl, &limited(2)).unwrap();
    assert_eq!(batch.items.len(), 2);
    assert!(batch.truncated);

    // A limit covering every record, trailing blank line included, is not a truncation
    assert!(!load_batch(&jsonl, &limited(3)).unwrap().truncated);
    assert!(!load_batch(&jsonl, &SourceOptions::default()).unwrap().truncated);

    assert!(load_batch(&csv, &limited(1)).unwrap().truncated);
    assert!(!load_batch(&csv, &limited(2)).unwrap().truncated);
}
