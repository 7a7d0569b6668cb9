//! Chunked Blob Store Abstraction
//!
//! This module provides the contract of the chunked blob store the archive
//! is layered on. Files are split into fixed-size chunks and described by a
//! single file record (id, filename, length, upload date, metadata), in the
//! manner of a GridFS bucket. Backends implement [`ChunkStore`]; the archive
//! service only ever talks to the trait.

pub mod config;
pub mod mock_store;
pub mod sqlite_store;

#[cfg(test)]
mod comprehensive_test;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Primary key field name of a file record.
pub const ID_FIELD: &str = "_id";
pub const FILENAME_FIELD: &str = "filename";
pub const LENGTH_FIELD: &str = "length";
pub const CHUNK_SIZE_FIELD: &str = "chunkSize";
pub const UPLOAD_DATE_FIELD: &str = "uploadDate";
/// Prefix addressing a key inside the metadata document, e.g. `metadata.sha256`.
pub const METADATA_PREFIX: &str = "metadata.";

/// Free-form metadata stored alongside a file.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Source of upload timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock, used by every store unless a test injects its own.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Opaque identifier assigned to a file when it is committed.
///
/// Identifiers are time-ordered, so sorting on `_id` follows upload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(Uuid);

impl BlobId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for BlobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A committed file record as returned by [`ChunkStore::find`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub id: BlobId,
    pub filename: String,
    pub length: u64,
    pub chunk_size: u64,
    pub upload_date: DateTime<Utc>,
    pub metadata: Metadata,
}

impl StoredFile {
    /// Look up a field by its store-level name. `None` means the field is missing.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            ID_FIELD => Some(Value::Text(self.id.to_string())),
            FILENAME_FIELD => Some(Value::Text(self.filename.clone())),
            LENGTH_FIELD => i64::try_from(self.length).ok().map(Value::Integer),
            CHUNK_SIZE_FIELD => i64::try_from(self.chunk_size).ok().map(Value::Integer),
            UPLOAD_DATE_FIELD => Some(Value::Timestamp(self.upload_date)),
            _ => {
                let key = name.strip_prefix(METADATA_PREFIX)?;
                match self.metadata.get(key)? {
                    serde_json::Value::String(s) => Some(Value::Text(s.clone())),
                    serde_json::Value::Number(n) => n.as_i64().map(Value::Integer),
                    _ => None,
                }
            }
        }
    }

    /// Value of a string metadata entry.
    #[cfg(test)]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Options for a single upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size_bytes: usize,
    pub metadata: Metadata,
}

/// A typed scalar that filters compare against.
///
/// Values of different kinds never compare equal and never satisfy a range
/// bound on each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Integer(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Conditions on file records. All terms of an `And` must hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Empty,
    Eq(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::Eq(field.into(), value)
    }

    pub fn gte(field: impl Into<String>, value: Value) -> Self {
        Filter::Gte(field.into(), value)
    }

    pub fn lte(field: impl Into<String>, value: Value) -> Self {
        Filter::Lte(field.into(), value)
    }

    /// Combine terms with AND; no terms yields [`Filter::Empty`].
    pub fn and(mut terms: Vec<Filter>) -> Self {
        match terms.len() {
            0 => Filter::Empty,
            1 => terms.remove(0),
            _ => Filter::And(terms),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::Empty)
    }

    pub fn matches(&self, file: &StoredFile) -> bool {
        match self {
            Filter::Empty => true,
            Filter::Eq(field, expected) => file.field(field).as_ref() == Some(expected),
            Filter::Gte(field, bound) => file
                .field(field)
                .map_or(false, |v| v.same_kind(bound) && v >= *bound),
            Filter::Lte(field, bound) => file
                .field(field)
                .map_or(false, |v| v.same_kind(bound) && v <= *bound),
            Filter::And(terms) => terms.iter().all(|t| t.matches(file)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordered sort keys sharing one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub fields: Vec<String>,
    pub direction: SortDirection,
}

impl SortSpec {
    /// Compare two records; missing fields sort before present ones.
    pub fn compare(&self, a: &StoredFile, b: &StoredFile) -> Ordering {
        for field in &self.fields {
            let ord = a.field(field).cmp(&b.field(field));
            let ord = match self.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// A cursor description: filter, then sort, then skip, then limit.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub filter: Filter,
    pub skip: u64,
    /// Maximum number of records, 0 for unbounded.
    pub limit: u64,
    pub sort: Option<SortSpec>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            skip: 0,
            limit: 0,
            sort: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Evaluate the query over records given in insertion order.
    pub fn apply(&self, files: impl IntoIterator<Item = StoredFile>) -> Vec<StoredFile> {
        let mut matched: Vec<StoredFile> = files
            .into_iter()
            .filter(|f| self.filter.matches(f))
            .collect();
        if let Some(sort) = &self.sort {
            // stable: ties keep insertion order
            matched.sort_by(|a, b| sort.compare(a, b));
        }
        let skip = usize::try_from(self.skip).unwrap_or(usize::MAX);
        let limit = match self.limit {
            0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        };
        matched.into_iter().skip(skip).take(limit).collect()
    }
}

impl Default for FindQuery {
    fn default() -> Self {
        Self::new(Filter::Empty)
    }
}

/// Errors raised by chunk store backends
#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("no file found with id {0}")]
    FileNotFound(BlobId),

    #[error("duplicate value for unique field {field}: {value}")]
    DuplicateKey { field: String, value: String },

    #[error("file {id} is corrupt: {reason}")]
    Corrupt { id: BlobId, reason: String },

    #[error("unsupported field for index: {0}")]
    UnsupportedField(String),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait defining the chunked blob store interface
pub trait ChunkStore: Send + Sync {
    /// Read `source` to its end in `chunk_size_bytes` slices and commit it as one file.
    ///
    /// The commit is atomic: on error no file record or chunk is left behind.
    fn upload_from_stream(
        &self,
        filename: &str,
        source: &mut dyn Read,
        options: &UploadOptions,
    ) -> Result<BlobId, ChunkStoreError>;

    /// Write the full content of a file into `sink`, one chunk at a time.
    /// Returns the number of bytes written.
    fn download_to_stream(&self, id: &BlobId, sink: &mut dyn Write) -> Result<u64, ChunkStoreError>;

    /// Run a query over the file records.
    fn find(&self, query: &FindQuery) -> Result<Vec<StoredFile>, ChunkStoreError>;

    /// Remove a file record and its chunks. Returns false when nothing matched.
    fn delete(&self, id: &BlobId) -> Result<bool, ChunkStoreError>;

    /// Count the file records matching `filter`.
    fn count_documents(&self, filter: &Filter) -> Result<u64, ChunkStoreError>;

    /// Enforce uniqueness of a field across file records. Records lacking the
    /// field are not constrained. Creating an existing index is a no-op.
    fn create_unique_index(&self, field: &str) -> Result<(), ChunkStoreError>;
}

/// Fill `buf` from `source`, stopping early only at end of stream.
pub(crate) fn read_chunk(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Store-side timestamps keep millisecond precision.
pub(crate) fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

/// String form of a metadata value, used when reporting unique-key conflicts.
pub(crate) fn unique_value(metadata: &Metadata, field: &str) -> Option<String> {
    let key = field.strip_prefix(METADATA_PREFIX)?;
    metadata.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
