//! Configuration for chunk store backends

use crate::chunkstore::{mock_store::MockChunkStore, sqlite_store::SQLiteChunkStore, ChunkStore, ChunkStoreError};
use crate::config::StoreConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Available chunk store backends
///
/// Configuration names are case-insensitive and `memory` is accepted for `Mock`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(try_from = "String")]
pub enum ChunkStoreBackend {
    #[default]
    SQLite,
    Mock,
}

impl std::str::FromStr for ChunkStoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(ChunkStoreBackend::SQLite),
            "mock" | "memory" => Ok(ChunkStoreBackend::Mock),
            _ => Err(format!("Unknown chunk store backend: {}", s)),
        }
    }
}

impl TryFrom<String> for ChunkStoreBackend {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Create a chunk store instance based on the configuration
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn ChunkStore>, ChunkStoreError> {
    if config.chunk_size_bytes == 0 {
        return Err(ChunkStoreError::InvalidConfig("chunk_size_bytes must be positive".into()));
    }
    match config.backend {
        ChunkStoreBackend::SQLite => {
            info!("Creating SQLite chunk store");
            Ok(Arc::new(SQLiteChunkStore::from_config(config)?))
        }
        ChunkStoreBackend::Mock => {
            info!("Creating mock chunk store");
            Ok(Arc::new(MockChunkStore::new()))
        }
    }
}
