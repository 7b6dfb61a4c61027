//! # Record store
//!
//! Append-only list of remembered texts. Record `i` belongs to vector `i` in the
//! similarity index; [`crate::store::Store`] is the only thing that appends, and it
//! always appends to both sides together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MemoryError, Result};

/// Free-form key/value payload attached to a record.
pub type Extra = Map<String, Value>;

/// A remembered text and everything known about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The text that was embedded (for chat memories, the user's question).
    pub text: String,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Caller-defined payload, e.g. `{"response": "...", "used_context": true}`.
    pub extra: Extra,
}

impl Record {
    /// The stored answer, if this record came from a chat round-trip.
    pub fn response(&self) -> Option<&str> {
        self.extra.get("response").and_then(Value::as_str)
    }

    /// The per-record mirror kept next to the records in the artifact.
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            text: self.text.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Legacy per-record info persisted alongside [`Record`]s, index-aligned with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    records: Vec<Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Append a record stamped with the current time and return its ID.
    pub fn append(&mut self, text: String, extra: Extra) -> usize {
        let id = self.records.len();
        self.records.push(Record {
            text,
            timestamp: Utc::now(),
            extra,
        });
        id
    }

    pub fn get(&self, id: usize) -> Result<&Record> {
        self.records.get(id).ok_or(MemoryError::OutOfRange {
            id,
            len: self.records.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn metadata(&self) -> Vec<RecordMeta> {
        self.records.iter().map(Record::meta).collect()
    }
}
