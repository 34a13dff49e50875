//! Resumable, prioritized, chunked media uploads.
//!
//! Files go into an [`UploadManager`] queue and are uploaded one at a time
//! in fixed-size chunks against a session record, then registered as a
//! single media asset. The queue survives restarts as a metadata snapshot.

pub mod backends;
pub mod config;
pub mod core;
pub mod thumbnail;
pub mod utils;

// Re-export the core types
pub use crate::core::{
    QueueConfig,
    Result,
    UploadError,
    UploadEvent,
    UploadFile,
    UploadId,
    UploadItem,
    UploadManager,
    UploadManagerBuilder,
    UploadManagerHandle,
    UploadStatus,
};

pub use thumbnail::{ThumbnailConfig, ThumbnailGenerator};
