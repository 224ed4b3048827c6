//! Work item sources
//!
//! Loads a finite, ordered batch of [`WorkItem`]s from a file. Supported
//! formats are JSON Lines (`.jsonl`, `.ndjson`), a JSON array (`.json`) and
//! CSV with a header row (`.csv`). Every record must carry a stable id so
//! checkpoint lookups stay valid across runs.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

use crate::WorkItem;

/// Default name of the id field
pub const DEFAULT_ID_FIELD: &str = "id";

/// Source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// File extension not recognised
    #[error("unsupported input format: {0} (expected .jsonl, .ndjson, .json or .csv)")]
    UnsupportedFormat(String),

    /// Record could not be parsed
    #[error("record {record}: parse error: {message}")]
    Parse {
        /// 1-based record number; the line number for JSON Lines
        record: usize,
        /// Parser message
        message: String,
    },

    /// Record lacks a usable id
    #[error("record {record}: missing or empty id field '{field}'")]
    MissingId {
        /// 1-based record number
        record: usize,
        /// Id field name
        field: String,
    },

    /// Id is neither a string nor an integer
    #[error("record {record}: id field '{field}' must be a string or an integer")]
    InvalidId {
        /// 1-based record number
        record: usize,
        /// Id field name
        field: String,
    },

    /// The same id appears twice
    #[error("record {record}: duplicate id '{id}'")]
    DuplicateId {
        /// Duplicated id
        id: String,
        /// 1-based record number of the second occurrence
        record: usize,
    },

    /// Configured payload field is absent
    #[error("record {record}: missing payload field '{field}'")]
    MissingPayload {
        /// 1-based record number
        record: usize,
        /// Payload field name
        field: String,
    },
}

/// Input file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// One JSON object per line
    JsonLines,
    /// A single JSON array of objects
    JsonArray,
    /// CSV with a header row
    Csv,
}

impl SourceFormat {
    /// Detect the format from the file extension
    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            "json" => Ok(Self::JsonArray),
            "csv" => Ok(Self::Csv),
            _ => Err(SourceError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// How records map onto work items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOptions {
    /// Field holding the stable item id
    pub id_field: String,
    /// Field holding the payload; the whole record when `None`
    pub payload_field: Option<String>,
    /// Stop after this many records
    pub limit: Option<usize>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            payload_field: None,
            limit: None,
        }
    }
}

/// Work items read from a file
#[derive(Debug)]
pub struct WorkBatch {
    /// Items in file order
    pub items: Vec<WorkItem>,
    /// Whether `limit` left records of the file unread
    pub truncated: bool,
}

/// Load work items from `path`
pub fn load_items(path: &Path, options: &SourceOptions) -> Result<Vec<WorkItem>, SourceError> {
    load_batch(path, options).map(|batch| batch.items)
}

/// Load work items from `path`, noting whether `options.limit` cut the file short
pub fn load_batch(path: &Path, options: &SourceOptions) -> Result<WorkBatch, SourceError> {
    let format = SourceFormat::from_path(path)?;
    debug!(path = %path.display(), ?format, "Loading work items");

    let (records, truncated) = match format {
        SourceFormat::JsonLines => read_json_lines(path, options.limit)?,
        SourceFormat::JsonArray => read_json_array(path, options.limit)?,
        SourceFormat::Csv => read_csv(path, options.limit)?,
    };

    let items = items_from_records(records, options)?;
    info!(path = %path.display(), items = items.len(), truncated, "Work items loaded");
    Ok(WorkBatch { items, truncated })
}

/// Turn parsed records into work items, validating ids
pub fn items_from_records(
    records: Vec<Value>,
    options: &SourceOptions,
) -> Result<Vec<WorkItem>, SourceError> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut items = Vec::with_capacity(records.len());

    for (index, mut record) in records.into_iter().enumerate() {
        let number = index + 1;
        let id = extract_id(&record, &options.id_field, number)?;
        if !seen.insert(id.clone()) {
            return Err(SourceError::DuplicateId { id, record: number });
        }

        let payload = match &options.payload_field {
            Some(field) => record
                .get_mut(field.as_str())
                .map(Value::take)
                .ok_or_else(|| SourceError::MissingPayload {
                    record: number,
                    field: field.clone(),
                })?,
            None => record,
        };
        items.push(WorkItem::new(id, payload));
    }
    Ok(items)
}

fn extract_id(record: &Value, field: &str, number: usize) -> Result<String, SourceError> {
    match record.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(SourceError::MissingId {
            record: number,
            field: field.to_string(),
        }),
        Some(_) => Err(SourceError::InvalidId {
            record: number,
            field: field.to_string(),
        }),
    }
}

fn open(path: &Path) -> Result<File, SourceError> {
    File::open(path).map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))
}

type Records = (Vec<Value>, bool);

fn limit_reached(limit: Option<usize>, count: usize) -> bool {
    limit.is_some_and(|limit| count >= limit)
}

fn read_json_lines(path: &Path, limit: Option<usize>) -> Result<Records, SourceError> {
    let reader = BufReader::new(open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| SourceError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        if limit_reached(limit, records.len()) {
            return Ok((records, true));
        }
        let record = serde_json::from_str(&line).map_err(|e| SourceError::Parse {
            record: index + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok((records, false))
}

fn read_json_array(path: &Path, limit: Option<usize>) -> Result<Records, SourceError> {
    let reader = BufReader::new(open(path)?);
    let mut records: Vec<Value> =
        serde_json::from_reader(reader).map_err(|e| SourceError::Parse {
            record: 1,
            message: format!("expected a JSON array of objects: {e}"),
        })?;
    let truncated = match limit {
        Some(limit) if records.len() > limit => {
            records.truncate(limit);
            true
        }
        _ => false,
    };
    Ok((records, truncated))
}

fn read_csv(path: &Path, limit: Option<usize>) -> Result<Records, SourceError> {
    let mut reader = csv::Reader::from_reader(open(path)?);
    let headers = reader
        .headers()
        .map_err(|e| SourceError::Parse {
            record: 0,
            message: e.to_string(),
        })?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        if limit_reached(limit, records.len()) {
            return Ok((records, true));
        }
        let row = row.map_err(|e| SourceError::Parse {
            record: records.len() + 1,
            message: e.to_string(),
        })?;
        let object: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
            .collect();
        records.push(Value::Object(object));
    }
    Ok((records, false))
}
