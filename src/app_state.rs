//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use std::sync::Arc;
use log::info;

use crate::chunkstore::{config::create_store, mock_store::MockChunkStore, ChunkStore};
use crate::config::AppConfig;
use crate::error::ArchiveError;
use crate::service::ArchiveService;

/// Application state shared by every worker
#[derive(Clone)]
pub struct AppState {
    pub archive_service: Arc<ArchiveService>,
    pub config: AppConfig,
}

impl AppState {
    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> Result<Self, ArchiveError> {
        info!(
            "Initializing application state: backend {:?}, database {}, bucket {}, chunk size {}",
            config.store.backend, config.store.database_name, config.store.bucket_name, config.store.chunk_size_bytes
        );
        let store = create_store(&config.store)?;
        Self::with_store(config, store)
    }

    /// Create application state over an already constructed store
    pub fn with_store(config: AppConfig, store: Arc<dyn ChunkStore>) -> Result<Self, ArchiveError> {
        let archive_service = Arc::new(ArchiveService::new(store, config.store.chunk_size_bytes)?);
        info!("Application state initialized successfully");
        Ok(Self {
            archive_service,
            config,
        })
    }

    /// Create application state for testing with the mock backend
    pub fn new_for_testing() -> Result<Self, ArchiveError> {
        let mut config = AppConfig::default();
        config.upload.temp_dir = std::env::temp_dir().to_string_lossy().into_owned();
        Self::with_store(config, Arc::new(MockChunkStore::new()))
    }
}
