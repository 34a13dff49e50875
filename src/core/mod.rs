mod chunk;
mod errors;
mod item;
mod manager;
mod manager_worker;
mod persistence;
mod queue;
mod session;
mod traits;
pub mod types;

pub use chunk::{calculate_chunks, chunk_progress, total_chunks, ChunkInfo};
pub use errors::{Result, UploadError};
pub use item::UploadItem;
pub use manager::{FilteredEventReceiver, UploadManager, UploadManagerBuilder, UploadManagerHandle};
pub use persistence::{reconcile, PersistenceBridge, QueueSnapshot, SESSION_INTERRUPTED, SNAPSHOT_VERSION};
pub use session::{
    SessionCoordinator,
    TaskEvent,
    UploadControl,
    UploadJob,
    UploadOutcome,
    HISTORY_EVENT_MEDIA_UPLOADED,
};
pub use traits::{
    AssetType,
    MetadataStore,
    NewHistoryEvent,
    NewMediaAsset,
    NewUploadChunk,
    NewUploadSession,
    ObjectStorage,
    PutOptions,
    SessionStatus,
    StateStore,
};
pub use types::{
    QueueConfig,
    UploadEvent,
    UploadFile,
    UploadId,
    UploadStatus,
    DEFAULT_CHUNK_SIZE,
    DEFAULT_STATE_KEY,
};
