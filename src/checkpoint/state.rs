//! Checkpoint document
//!
//! The checkpoint is a pretty-printed JSON file so it stays human-inspectable.
//! Unknown fields are ignored and every field except `schema_version` has a
//! default, which keeps older and newer minor versions loadable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{ErrorKind, Outcome, TaskResult};

/// Current checkpoint schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Resumable position of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Number of items with a recorded terminal result
    pub processed: u64,
    /// Most recently recorded item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,
}

/// Bookkeeping about the run lineage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// When the lineage started
    pub created_at: DateTime<Utc>,
    /// Runs that loaded or created this checkpoint
    #[serde(default)]
    pub runs: u32,
    /// Successful flushes so far
    #[serde(default)]
    pub flushes: u64,
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            runs: 1,
            flushes: 0,
        }
    }
}

/// Durable progress record: every terminal result of the run lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    schema_version: String,
    #[serde(default)]
    cursor: Cursor,
    #[serde(default)]
    results: BTreeMap<String, TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: CheckpointMetadata,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    /// Create an empty checkpoint
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            cursor: Cursor::default(),
            results: BTreeMap::new(),
            saved_at: None,
            metadata: CheckpointMetadata::default(),
        }
    }

    /// Schema version this document was written with
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Resumable cursor
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// All recorded results, keyed by item id
    pub fn results(&self) -> &BTreeMap<String, TaskResult> {
        &self.results
    }

    /// Result recorded for one item
    pub fn get(&self, item_id: &str) -> Option<&TaskResult> {
        self.results.get(item_id)
    }

    /// When the checkpoint was last persisted
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    /// Lineage metadata
    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    /// Number of recorded results
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no result is recorded
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Ids of items that succeeded
    pub fn succeeded_ids(&self) -> impl Iterator<Item = &str> {
        self.results
            .values()
            .filter(|r| r.is_success())
            .map(|r| r.item_id())
    }

    /// Number of successful results
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    /// Number of failed results
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Record a terminal result.
    ///
    /// Keys are never removed. A success is never replaced by a failure, so a
    /// duplicate call redone after a crash cannot downgrade an item. Returns
    /// whether the map changed.
    pub fn insert(&mut self, result: TaskResult) -> bool {
        if let Some(existing) = self.results.get(result.item_id()) {
            if existing.is_success() && !result.is_success() {
                debug!(
                    item_id = %result.item_id(),
                    "Keeping earlier success over later failure"
                );
                return false;
            }
        }
        self.cursor.last_completed = Some(result.item_id().to_string());
        self.results.insert(result.item_id().to_string(), result);
        self.cursor.processed = self.results.len() as u64;
        true
    }

    /// Failed results grouped by classification
    pub fn failures_by_kind(&self) -> BTreeMap<ErrorKind, usize> {
        let mut groups = BTreeMap::new();
        for result in self.results.values() {
            if let Outcome::PermanentFailure { kind, .. } = result.outcome() {
                *groups.entry(*kind).or_insert(0) += 1;
            }
        }
        groups
    }

    /// Validate schema version (accepts any version with the current major)
    pub fn validate_schema_version(&self) -> Result<(), CheckpointError> {
        if major(&self.schema_version) != major(SCHEMA_VERSION) {
            return Err(CheckpointError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Mark a new run resuming this lineage
    pub(crate) fn begin_run(&mut self) {
        self.metadata.runs += 1;
    }

    /// Stamp the document right before it is written
    pub(crate) fn mark_saved(&mut self) {
        self.schema_version = SCHEMA_VERSION.to_string();
        self.saved_at = Some(Utc::now());
        self.metadata.flushes += 1;
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    /// Parse and validate a JSON document
    pub fn from_json(contents: &str) -> Result<Self, CheckpointError> {
        let checkpoint: Checkpoint = serde_json::from_str(contents)
            .map_err(|e| CheckpointError::Deserialization(e.to_string()))?;
        checkpoint.validate_schema_version()?;
        Ok(checkpoint)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Errors related to checkpoint persistence
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Checkpoint file too large
    #[error("checkpoint file too large: {size} bytes (max: {max} bytes)")]
    TooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Lock error
    #[error("lock error: {0}")]
    Lock(String),
}
