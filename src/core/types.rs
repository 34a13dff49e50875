use std::path::Path;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::errors::Result;
use super::item::UploadItem;

/// Default chunk size: 5MB
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Key under which the queue snapshot is stored
pub const DEFAULT_STATE_KEY: &str = "upload_queue";

/// Upload item unique identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UploadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Waiting in the backlog
    Queued,
    /// Chunk loop running
    Uploading,
    /// Stopped by the user, keeps its session
    Paused,
    /// All chunks acknowledged, finalizing the asset
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Uploading or finalizing
    pub fn is_active(self) -> bool {
        matches!(self, Self::Uploading | Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Binary payload of an upload. Never serialized.
#[derive(Clone)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self::new(name, mime_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Runtime settings of an upload queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Authenticated user, first segment of every object path
    pub owner_id: String,
    /// Storage bucket for chunks and final assets
    pub bucket: String,
    pub chunk_size: usize,
    pub default_priority: i32,
    /// Abort the in-flight chunk request on pause/remove instead of
    /// waiting for the chunk boundary
    pub abort_in_flight: bool,
    pub state_key: String,
}

impl QueueConfig {
    pub fn new(owner_id: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_abort_in_flight(mut self, abort_in_flight: bool) -> Self {
        self.abort_in_flight = abort_in_flight;
        self
    }

    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = state_key.into();
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            bucket: "media".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_priority: 0,
            abort_in_flight: false,
            state_key: DEFAULT_STATE_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// New item in the backlog
    Enqueued {
        upload_id: UploadId,
    },

    StateChanged {
        upload_id: UploadId,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },

    Progress {
        upload_id: UploadId,
        progress: u8,
    },

    Completed {
        upload_id: UploadId,
        asset_path: String,
        public_url: String,
    },

    Failed {
        upload_id: UploadId,
        error: String,
    },

    Removed {
        upload_id: UploadId,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> UploadId {
        match self {
            Self::Enqueued { upload_id }
            | Self::StateChanged { upload_id, .. }
            | Self::Progress { upload_id, .. }
            | Self::Completed { upload_id, .. }
            | Self::Failed { upload_id, .. }
            | Self::Removed { upload_id } => *upload_id,
        }
    }
}

pub(crate) enum ManagerCommand {
    Enqueue {
        file: UploadFile,
        draft_id: String,
        priority: Option<i32>,
        thumbnail: Option<String>,
        reply: oneshot::Sender<UploadId>,
    },

    Reprioritize {
        upload_id: UploadId,
        priority: i32,
        reply: oneshot::Sender<Result<()>>,
    },

    Pause {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    Resume {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    Retry {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    Remove {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    GetItem {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadItem>>,
    },

    GetAllItems {
        reply: oneshot::Sender<Vec<UploadItem>>,
    },

    /// Drop every completed item
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
