use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use super::errors::Result;

/// Options for a single object write
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Replace an existing object at the same path
    pub overwrite: bool,
    pub content_type: Option<String>,
}

impl PutOptions {
    pub fn overwrite(content_type: impl Into<String>) -> Self {
        Self {
            overwrite: true,
            content_type: Some(content_type.into()),
        }
    }
}

/// Object/blob storage service
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, bucket: &str, path: &str, data: Bytes, options: PutOptions) -> Result<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUploadSession {
    pub owner_id: String,
    pub draft_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub chunk_size: usize,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUploadChunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub chunk_size: usize,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Video,
    Audio,
    Document,
}

impl AssetType {
    pub fn from_mime(mime_type: &str) -> Self {
        match mime_type.split('/').next() {
            Some("image") => Self::Image,
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            _ => Self::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMediaAsset {
    pub owner_id: String,
    pub draft_id: String,
    pub path: String,
    pub asset_type: AssetType,
    pub file_size: u64,
    pub mime_type: String,
    pub original_filename: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryEvent {
    pub draft_id: String,
    pub owner_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

/// Relational metadata store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Returns the new session id
    async fn create_upload_session(&self, session: NewUploadSession) -> Result<String>;

    async fn update_upload_session(&self, session_id: &str, status: SessionStatus) -> Result<()>;

    /// Must be idempotent per `(session_id, chunk_index)`
    async fn insert_upload_chunk(&self, chunk: NewUploadChunk) -> Result<()>;

    async fn insert_media_asset(&self, asset: NewMediaAsset) -> Result<()>;

    async fn insert_history_event(&self, event: NewHistoryEvent) -> Result<()>;
}

/// Durable local key/value storage for queue snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, key: &str, snapshot: String) -> Result<()>;

    async fn load(&self, key: &str) -> Result<Option<String>>;
}
