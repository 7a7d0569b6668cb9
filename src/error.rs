//! Archive error taxonomy and its HTTP mapping

use crate::chunkstore::ChunkStoreError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the archive service
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Malformed request parameters or missing required input
    #[error("{0}")]
    Validation(String),

    /// The uploaded content is already archived under this hash
    #[error("A document already exists with hash: {0}")]
    DuplicateContent(String),

    #[error("{0}")]
    NotFound(String),

    /// I/O or backing store failure
    #[error("storage error: {0}")]
    Storage(#[source] ChunkStoreError),
}

impl ArchiveError {
    pub fn validation(message: impl Into<String>) -> Self {
        ArchiveError::Validation(message.into())
    }

    /// Message of the innermost error in the source chain.
    pub fn root_cause_message(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current.to_string()
    }
}

impl From<ChunkStoreError> for ArchiveError {
    fn from(err: ChunkStoreError) -> Self {
        match err {
            ChunkStoreError::DuplicateKey { value, .. } => ArchiveError::DuplicateContent(value),
            ChunkStoreError::FileNotFound(id) => ArchiveError::NotFound(format!("ID {} not found", id)),
            other => ArchiveError::Storage(other),
        }
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Storage(ChunkStoreError::Io(err))
    }
}

impl ResponseError for ArchiveError {
    fn status_code(&self) -> StatusCode {
        match self {
            ArchiveError::Validation(_) | ArchiveError::DuplicateContent(_) => StatusCode::BAD_REQUEST,
            ArchiveError::NotFound(_) => StatusCode::NOT_FOUND,
            ArchiveError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            ArchiveError::Storage(cause) => {
                error!("Storage failure: {} ({:?})", self, cause);
                self.root_cause_message()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(json!({ "error": message }))
    }
}
