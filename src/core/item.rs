use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::errors::{Result, UploadError};
use super::types::{UploadFile, UploadId, UploadStatus};

/// One file's journey through the pipeline.
///
/// Everything here is serializable: the binary payload lives next to the
/// item inside the manager and is never part of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: UploadId,
    pub draft_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Percent, 0-100
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub total_chunks: Option<u32>,
    /// Chunks acknowledged in the current session
    #[serde(default)]
    pub chunks_acknowledged: u32,
    pub priority: i32,
    pub thumbnail: Option<String>,
    pub asset_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadItem {
    pub fn new(file: &UploadFile, draft_id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: UploadId::new(),
            draft_id: draft_id.into(),
            file_name: file.name.clone(),
            file_size: file.size(),
            mime_type: file.mime_type.clone(),
            progress: 0,
            status: UploadStatus::Queued,
            error: None,
            session_id: None,
            total_chunks: None,
            chunks_acknowledged: 0,
            priority,
            thumbnail: None,
            asset_path: None,
            created_at: Utc::now(),
            start_time: None,
            completed_at: None,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: Option<String>) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    pub fn is_valid_transition(from: UploadStatus, to: UploadStatus) -> bool {
        use UploadStatus::*;

        matches!(
            (from, to),
            (Queued, Uploading)
                | (Queued, Paused)
                | (Uploading, Paused)
                | (Uploading, Processing)
                | (Uploading, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Paused, Queued)
                | (Failed, Queued)
        )
    }

    /// Move to `to`, returning the previous status
    pub(crate) fn transition(&mut self, to: UploadStatus, action: &'static str) -> Result<UploadStatus> {
        let from = self.status;
        if !Self::is_valid_transition(from, to) {
            return Err(UploadError::InvalidState {
                upload_id: self.id,
                status: from,
                action,
            });
        }

        self.status = to;
        if to != UploadStatus::Failed {
            self.error = None;
        }

        Ok(from)
    }

    /// Like [`transition`](Self::transition), but only from one of `allowed`
    fn transition_from(
        &mut self,
        allowed: &[UploadStatus],
        to: UploadStatus,
        action: &'static str,
    ) -> Result<UploadStatus> {
        if !allowed.contains(&self.status) {
            return Err(UploadError::InvalidState {
                upload_id: self.id,
                status: self.status,
                action,
            });
        }
        self.transition(to, action)
    }

    pub(crate) fn pause(&mut self) -> Result<UploadStatus> {
        self.transition_from(&[UploadStatus::Queued, UploadStatus::Uploading], UploadStatus::Paused, "pause")
    }

    /// Paused items requeue with their session and acknowledged chunks intact
    pub(crate) fn resume(&mut self) -> Result<UploadStatus> {
        self.transition_from(&[UploadStatus::Paused], UploadStatus::Queued, "resume")
    }

    pub(crate) fn start(&mut self) -> Result<UploadStatus> {
        let old = self.transition(UploadStatus::Uploading, "start")?;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        Ok(old)
    }

    /// Progress never goes backwards while a session is alive
    pub(crate) fn set_progress(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if progress > self.progress {
            self.progress = progress;
            true
        } else {
            false
        }
    }

    /// A finished upload completes even if it was paused meanwhile
    pub(crate) fn complete(&mut self, asset_path: String) -> UploadStatus {
        let old = self.status;
        self.status = UploadStatus::Completed;
        self.error = None;
        self.progress = 100;
        self.asset_path = Some(asset_path);
        self.completed_at = Some(Utc::now());
        old
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) -> UploadStatus {
        let old = self.status;
        self.status = UploadStatus::Failed;
        self.error = Some(error.into());
        old
    }

    /// Failed items restart from chunk 0 with a fresh session
    pub(crate) fn reset_for_retry(&mut self) -> Result<UploadStatus> {
        let old = self.transition_from(&[UploadStatus::Failed], UploadStatus::Queued, "retry")?;
        self.progress = 0;
        self.session_id = None;
        self.total_chunks = None;
        self.chunks_acknowledged = 0;
        self.start_time = None;
        Ok(old)
    }
}
