use thiserror::Error;
use super::types::{UploadId, UploadStatus};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to create upload session: {0}")]
    SessionCreation(String),

    #[error("Chunk {index} failed: {message}")]
    ChunkUpload {
        index: u32,
        message: String,
    },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Finalization failed: {0}")]
    Finalization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upload {0} not found")]
    NotFound(UploadId),

    #[error("Cannot {action} upload {upload_id} in state {status}")]
    InvalidState {
        upload_id: UploadId,
        status: UploadStatus,
        action: &'static str,
    },

    #[error("File payload for upload {0} is no longer available")]
    PayloadUnavailable(UploadId),

    #[error("Upload manager shut down")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn chunk(index: u32, source: impl std::fmt::Display) -> Self {
        Self::ChunkUpload {
            index,
            message: source.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
