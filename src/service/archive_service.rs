//! Archive service
//!
//! Hash, dedup-check, then commit. The read side projects stored records
//! into [`FileInfo`] and streams content back chunk by chunk.

use crate::chunkstore::{
    BlobId, ChunkStore, Filter, FindQuery, Metadata, StoredFile, UploadOptions, Value,
    FILENAME_FIELD, ID_FIELD,
};
use crate::error::ArchiveError;
use crate::service::dedup::DedupGuard;
use crate::service::hashing::{hash_stream, ContentHash};
use crate::service::query::{QueryBuilder, QuerySpec};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;

const SHA256_KEY: &str = "sha256";
const TICKET_NUMBER_KEY: &str = "ticketNumber";

/// Read-only view of an archived file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub id: BlobId,
    pub filename: String,
    pub length: u64,
    pub upload_date: DateTime<Utc>,
    pub metadata: Metadata,
}

impl From<StoredFile> for FileInfo {
    fn from(file: StoredFile) -> Self {
        Self {
            id: file.id,
            filename: file.filename,
            length: file.length,
            upload_date: file.upload_date,
            metadata: file.metadata,
        }
    }
}

pub struct ArchiveService {
    store: Arc<dyn ChunkStore>,
    dedup: DedupGuard,
    chunk_size: usize,
}

impl ArchiveService {
    /// Wrap `store` and install the unique hash index.
    pub fn new(store: Arc<dyn ChunkStore>, chunk_size: usize) -> Result<Self, ArchiveError> {
        if chunk_size == 0 {
            return Err(ArchiveError::validation("chunk size must be greater than zero"));
        }
        let dedup = DedupGuard::new(Arc::clone(&store));
        dedup.install_index()?;
        Ok(Self {
            store,
            dedup,
            chunk_size,
        })
    }

    /// Archive `source` under `filename`, tagged with an optional ticket number.
    pub fn upload<R: Read + Seek>(
        &self,
        source: R,
        filename: &str,
        ticket_number: Option<&str>,
    ) -> Result<BlobId, ArchiveError> {
        let mut metadata = Metadata::new();
        if let Some(ticket) = ticket_number.map(str::trim).filter(|t| !t.is_empty()) {
            metadata.insert(TICKET_NUMBER_KEY.into(), serde_json::Value::String(ticket.to_string()));
        }
        self.upload_with_metadata(source, filename, metadata)
    }

    /// Archive `source` with caller-supplied metadata. The `sha256` key is
    /// always computed here and overrides anything the caller put there.
    pub fn upload_with_metadata<R: Read + Seek>(
        &self,
        source: R,
        filename: &str,
        mut metadata: Metadata,
    ) -> Result<BlobId, ArchiveError> {
        if filename.trim().is_empty() {
            return Err(ArchiveError::validation("Filename is required"));
        }

        let (hash, mut source) = hash_stream(source)?;
        debug!("Computed sha256 {} for {}", hash, filename);
        self.dedup.ensure_unique(&hash)?;

        metadata.insert(SHA256_KEY.into(), serde_json::Value::String(hash.to_string()));
        let options = UploadOptions {
            chunk_size_bytes: self.chunk_size,
            metadata,
        };
        // a concurrent upload of the same bytes surfaces here as DuplicateKey
        let id = self.store.upload_from_stream(filename, &mut source, &options)?;
        info!("Archived {} as {} (sha256 {})", filename, id, hash);
        Ok(id)
    }

    pub fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        ticket_number: Option<&str>,
    ) -> Result<BlobId, ArchiveError> {
        let file = File::open(path)?;
        self.upload(file, filename, ticket_number)
    }

    pub fn list(&self, params: &HashMap<String, String>) -> Result<Vec<FileInfo>, ArchiveError> {
        let spec = QueryBuilder::build(params)?;
        self.query(&spec)
    }

    pub fn query(&self, spec: &QuerySpec) -> Result<Vec<FileInfo>, ArchiveError> {
        let files = self.store.find(&spec.to_find_query())?;
        debug!("Query matched {} file(s)", files.len());
        Ok(files.into_iter().map(FileInfo::from).collect())
    }

    pub fn count(&self) -> Result<u64, ArchiveError> {
        Ok(self.store.count_documents(&Filter::Empty)?)
    }

    pub fn get_info(&self, id: &str) -> Result<FileInfo, ArchiveError> {
        let id = parse_id(id)?;
        self.find_by_id(&id)?
            .map(FileInfo::from)
            .ok_or_else(|| ArchiveError::NotFound(format!("ID {} not found", id)))
    }

    /// Best effort: deleting an unknown id is not an error.
    pub fn delete(&self, id: &str) -> Result<(), ArchiveError> {
        let id = parse_id(id)?;
        if self.store.delete(&id)? {
            info!("Deleted {}", id);
        } else {
            warn!("Delete requested for unknown id {}", id);
        }
        Ok(())
    }

    /// Stream the content of `id` into `sink`. Returns the bytes written.
    pub fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, ArchiveError> {
        let id = parse_id(id)?;
        let written = self.store.download_to_stream(&id, sink)?;
        debug!("Streamed {} bytes of {}", written, id);
        Ok(written)
    }

    /// Anything that is not a hex SHA-256 digest cannot be archived.
    pub fn hash_exists(&self, hash: &str) -> Result<bool, ArchiveError> {
        match ContentHash::parse(hash.trim()) {
            Some(hash) => Ok(self.dedup.exists_by_hash(hash.as_str())?),
            None => Ok(false),
        }
    }

    pub fn id_exists(&self, id: &str) -> Result<bool, ArchiveError> {
        let id = parse_id(id)?;
        Ok(self.find_by_id(&id)?.is_some())
    }

    pub fn filename_exists(&self, filename: &str) -> Result<bool, ArchiveError> {
        let filter = Filter::eq(FILENAME_FIELD, Value::Text(filename.to_string()));
        Ok(self.store.count_documents(&filter)? > 0)
    }

    fn find_by_id(&self, id: &BlobId) -> Result<Option<StoredFile>, ArchiveError> {
        let query = FindQuery::new(Filter::eq(ID_FIELD, Value::Text(id.to_string()))).with_limit(1);
        Ok(self.store.find(&query)?.into_iter().next())
    }
}

fn parse_id(raw: &str) -> Result<BlobId, ArchiveError> {
    raw.trim()
        .parse()
        .map_err(|_| ArchiveError::validation(format!("Invalid id: {}", raw)))
}
