//! Duplicate content detection

use crate::chunkstore::{ChunkStore, ChunkStoreError, Filter, Value};
use crate::error::ArchiveError;
use crate::service::hashing::ContentHash;
use log::{debug, warn};
use std::sync::Arc;

/// Metadata field carrying the content hash of every archived file
pub const HASH_FIELD: &str = "metadata.sha256";

/// Rejects uploads whose content hash is already archived.
///
/// The count check is a fast path only: two concurrent uploads of the same
/// bytes can both pass it. The unique index installed by
/// [`DedupGuard::install_index`] is what finally rejects the second commit.
pub struct DedupGuard {
    store: Arc<dyn ChunkStore>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }

    pub fn install_index(&self) -> Result<(), ChunkStoreError> {
        self.store.create_unique_index(HASH_FIELD)
    }

    pub fn exists_by_hash(&self, hash: &str) -> Result<bool, ChunkStoreError> {
        let count = self
            .store
            .count_documents(&Filter::eq(HASH_FIELD, Value::Text(hash.to_string())))?;
        debug!("Found {} file(s) with hash {}", count, hash);
        Ok(count > 0)
    }

    /// Fail with `DuplicateContent` when `hash` is already archived.
    pub fn ensure_unique(&self, hash: &ContentHash) -> Result<(), ArchiveError> {
        if self.exists_by_hash(hash.as_str())? {
            warn!("A document already exists with hash: {}", hash);
            return Err(ArchiveError::DuplicateContent(hash.to_string()));
        }
        Ok(())
    }
}
