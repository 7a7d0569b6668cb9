//! Mock implementation of ChunkStore trait for testing

use crate::chunkstore::{
    read_chunk, system_clock, truncate_to_millis, unique_value, BlobId, ChunkStore,
    ChunkStoreError, Clock, Filter, FindQuery, StoredFile, UploadOptions, METADATA_PREFIX,
};
use log::debug;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

struct MockFile {
    info: StoredFile,
    chunks: Vec<Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    // insertion order is the natural order of the bucket
    files: Vec<MockFile>,
    unique_fields: Vec<String>,
}

/// In-memory chunk store with the same contract as the SQLite backend
pub struct MockChunkStore {
    state: Mutex<MockState>,
    clock: Clock,
}

impl MockChunkStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            clock: system_clock(),
        }
    }

    /// Replace the clock that stamps upload dates.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, ChunkStoreError> {
        self.state.lock().map_err(|_| ChunkStoreError::Poisoned)
    }

    /// Number of stored files (useful for test assertions)
    pub fn file_count(&self) -> usize {
        self.state.lock().map(|s| s.files.len()).unwrap_or(0)
    }

    /// Number of stored chunks across all files
    pub fn chunk_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.files.iter().map(|f| f.chunks.len()).sum())
            .unwrap_or(0)
    }

    /// Clear all files from the store
    #[cfg(test)]
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.files.clear();
        }
    }
}

impl Default for MockChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MockChunkStore {
    fn upload_from_stream(
        &self,
        filename: &str,
        source: &mut dyn Read,
        options: &UploadOptions,
    ) -> Result<BlobId, ChunkStoreError> {
        let chunk_size = options.chunk_size_bytes;
        if chunk_size == 0 {
            return Err(ChunkStoreError::InvalidConfig("chunk size must be positive".into()));
        }

        // chunks are staged outside the lock and committed in one step
        let mut chunks = Vec::new();
        let mut length: u64 = 0;
        let mut buffer = vec![0u8; chunk_size];
        loop {
            let read = read_chunk(source, &mut buffer)?;
            if read == 0 {
                break;
            }
            chunks.push(buffer[..read].to_vec());
            length += read as u64;
            if read < chunk_size {
                break;
            }
        }

        let mut state = self.state()?;
        for field in &state.unique_fields {
            let Some(value) = unique_value(&options.metadata, field) else {
                continue;
            };
            let taken = state
                .files
                .iter()
                .any(|f| unique_value(&f.info.metadata, field).as_deref() == Some(value.as_str()));
            if taken {
                return Err(ChunkStoreError::DuplicateKey { field: field.clone(), value });
            }
        }

        let id = BlobId::generate();
        let info = StoredFile {
            id,
            filename: filename.to_string(),
            length,
            chunk_size: chunk_size as u64,
            upload_date: truncate_to_millis((self.clock)()),
            metadata: options.metadata.clone(),
        };
        debug!("Mock store committed {} ({}) with {} chunks", id, filename, chunks.len());
        state.files.push(MockFile { info, chunks });
        Ok(id)
    }

    fn download_to_stream(&self, id: &BlobId, sink: &mut dyn Write) -> Result<u64, ChunkStoreError> {
        // copy the chunks out so a slow sink never holds the lock
        let chunks = {
            let state = self.state()?;
            let file = state
                .files
                .iter()
                .find(|f| f.info.id == *id)
                .ok_or(ChunkStoreError::FileNotFound(*id))?;
            file.chunks.clone()
        };
        let mut written = 0u64;
        for chunk in &chunks {
            sink.write_all(chunk)?;
            written += chunk.len() as u64;
        }
        sink.flush()?;
        Ok(written)
    }

    fn find(&self, query: &FindQuery) -> Result<Vec<StoredFile>, ChunkStoreError> {
        let state = self.state()?;
        Ok(query.apply(state.files.iter().map(|f| f.info.clone())))
    }

    fn delete(&self, id: &BlobId) -> Result<bool, ChunkStoreError> {
        let mut state = self.state()?;
        let before = state.files.len();
        state.files.retain(|f| f.info.id != *id);
        Ok(state.files.len() != before)
    }

    fn count_documents(&self, filter: &Filter) -> Result<u64, ChunkStoreError> {
        let state = self.state()?;
        Ok(state.files.iter().filter(|f| filter.matches(&f.info)).count() as u64)
    }

    fn create_unique_index(&self, field: &str) -> Result<(), ChunkStoreError> {
        if !field.starts_with(METADATA_PREFIX) {
            return Err(ChunkStoreError::UnsupportedField(field.to_string()));
        }
        let mut state = self.state()?;
        if !state.unique_fields.iter().any(|f| f == field) {
            state.unique_fields.push(field.to_string());
        }
        Ok(())
    }
}
