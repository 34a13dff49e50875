use std::sync::Arc;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use super::chunk::{calculate_chunks, chunk_progress, ChunkInfo};
use super::errors::{Result, UploadError};
use super::traits::{
    AssetType,
    MetadataStore,
    NewHistoryEvent,
    NewMediaAsset,
    NewUploadChunk,
    NewUploadSession,
    ObjectStorage,
    PutOptions,
    SessionStatus,
};
use super::types::{QueueConfig, UploadFile, UploadId, UploadStatus};

pub const HISTORY_EVENT_MEDIA_UPLOADED: &str = "media_uploaded";

/// Everything the chunk loop needs to upload one item
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub upload_id: UploadId,
    pub draft_id: String,
    pub file: UploadFile,
    /// Existing session of a paused upload
    pub session_id: Option<String>,
    /// First chunk still to send
    pub start_chunk: u32,
}

/// Cooperative stop signals for the in-flight upload
#[derive(Debug, Clone)]
pub struct UploadControl {
    pub token: CancellationToken,
    pub status: watch::Receiver<UploadStatus>,
}

impl UploadControl {
    pub fn is_paused(&self) -> bool {
        *self.status.borrow() == UploadStatus::Paused
    }
}

/// Progress reported by the chunk loop to the queue worker
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    SessionCreated {
        upload_id: UploadId,
        session_id: String,
        total_chunks: u32,
    },
    ChunkAcknowledged {
        upload_id: UploadId,
        index: u32,
        progress: u8,
    },
    /// All chunks acknowledged, asset being registered
    Finalizing {
        upload_id: UploadId,
    },
    /// The upload task returned
    Finished {
        upload_id: UploadId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Completed {
        asset_path: String,
        public_url: String,
    },
    /// Stopped at a chunk boundary because the item was paused
    Paused,
}

enum ChunkStep {
    Sent,
    Stopped,
}

/// Talks to storage and the metadata store on behalf of one item at a time
#[derive(Clone)]
pub struct SessionCoordinator {
    storage: Arc<dyn ObjectStorage>,
    metadata: Arc<dyn MetadataStore>,
    config: Arc<QueueConfig>,
}

impl SessionCoordinator {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        metadata: Arc<dyn MetadataStore>,
        config: Arc<QueueConfig>,
    ) -> Self {
        Self {
            storage,
            metadata,
            config,
        }
    }

    pub fn chunk_path(&self, session_id: &str, index: u32) -> String {
        format!("{}/{}/chunk_{}", self.config.owner_id, session_id, index)
    }

    pub fn asset_path(&self, job: &UploadJob) -> String {
        format!(
            "{}/{}/{}_{}",
            self.config.owner_id,
            job.draft_id,
            job.upload_id,
            sanitize_file_name(&job.file.name)
        )
    }

    /// Upload one item. Any failure after the session exists also marks
    /// the remote session failed.
    pub async fn run(
        &self,
        job: UploadJob,
        control: UploadControl,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Result<UploadOutcome> {
        let mut session_id = job.session_id.clone();
        let result = self.upload(&job, &control, &events, &mut session_id).await;

        if let Err(err) = &result {
            warn!(upload_id = %job.upload_id, error = %err, "upload failed");
            if let Some(session_id) = &session_id {
                if let Err(mark_err) = self.metadata
                    .update_upload_session(session_id, SessionStatus::Failed)
                    .await
                {
                    warn!(session_id = %session_id, error = %mark_err, "failed to mark session failed");
                }
            }
        }

        result
    }

    async fn upload(
        &self,
        job: &UploadJob,
        control: &UploadControl,
        events: &mpsc::UnboundedSender<TaskEvent>,
        session_slot: &mut Option<String>,
    ) -> Result<UploadOutcome> {
        let chunks = calculate_chunks(job.file.size(), self.config.chunk_size);
        let total_chunks = chunks.len() as u32;

        let session_id = match session_slot.clone() {
            Some(session_id) => {
                debug!(upload_id = %job.upload_id, session_id = %session_id, start_chunk = job.start_chunk, "resuming session");
                session_id
            }
            None => {
                let session_id = self.create_session(job, total_chunks).await?;
                *session_slot = Some(session_id.clone());
                let _ = events.send(TaskEvent::SessionCreated {
                    upload_id: job.upload_id,
                    session_id: session_id.clone(),
                    total_chunks,
                });
                session_id
            }
        };

        for chunk in chunks.iter().skip(job.start_chunk as usize) {
            if control.token.is_cancelled() {
                if control.is_paused() {
                    return Ok(UploadOutcome::Paused);
                }
                return Err(UploadError::Cancelled);
            }

            if control.is_paused() {
                return Ok(UploadOutcome::Paused);
            }

            match self.send_chunk(job, &session_id, chunk, control).await? {
                ChunkStep::Sent => {}
                ChunkStep::Stopped if control.is_paused() => return Ok(UploadOutcome::Paused),
                ChunkStep::Stopped => return Err(UploadError::Cancelled),
            }

            let progress = chunk_progress(chunk.index + 1, total_chunks);
            debug!(upload_id = %job.upload_id, index = chunk.index, progress, "chunk acknowledged");
            let _ = events.send(TaskEvent::ChunkAcknowledged {
                upload_id: job.upload_id,
                index: chunk.index,
                progress,
            });
        }

        // a removed item is never registered; a paused one finishes
        if control.token.is_cancelled() && !control.is_paused() {
            return Err(UploadError::Cancelled);
        }

        let _ = events.send(TaskEvent::Finalizing { upload_id: job.upload_id });
        self.finalize(job, &session_id, total_chunks).await
    }

    async fn create_session(&self, job: &UploadJob, total_chunks: u32) -> Result<String> {
        let session_id = self.metadata
            .create_upload_session(NewUploadSession {
                owner_id: self.config.owner_id.clone(),
                draft_id: job.draft_id.clone(),
                file_name: job.file.name.clone(),
                file_size: job.file.size(),
                mime_type: job.file.mime_type.clone(),
                chunk_size: self.config.chunk_size,
                total_chunks,
            })
            .await
            .map_err(|err| UploadError::SessionCreation(err.to_string()))?;

        info!(upload_id = %job.upload_id, session_id = %session_id, total_chunks, "upload session created");
        Ok(session_id)
    }

    async fn send_chunk(
        &self,
        job: &UploadJob,
        session_id: &str,
        chunk: &ChunkInfo,
        control: &UploadControl,
    ) -> Result<ChunkStep> {
        let data = chunk.slice(&job.file.data);
        let path = self.chunk_path(session_id, chunk.index);
        let options = PutOptions::overwrite("application/octet-stream");
        let put = self.storage.put_object(&self.config.bucket, &path, data, options);

        let put_result = if self.config.abort_in_flight {
            tokio::select! {
                result = put => result,
                _ = control.token.cancelled() => {
                    debug!(upload_id = %job.upload_id, index = chunk.index, "in-flight chunk abandoned");
                    return Ok(ChunkStep::Stopped);
                }
            }
        } else {
            put.await
        };
        put_result.map_err(|err| UploadError::chunk(chunk.index, err))?;

        self.metadata
            .insert_upload_chunk(NewUploadChunk {
                session_id: session_id.to_string(),
                chunk_index: chunk.index,
                chunk_size: chunk.size,
                status: "uploaded".to_string(),
            })
            .await
            .map_err(|err| UploadError::chunk(chunk.index, err))?;

        Ok(ChunkStep::Sent)
    }

    /// The chunks are a progress mechanism; the stored asset is one
    /// whole-file object.
    async fn finalize(&self, job: &UploadJob, session_id: &str, total_chunks: u32) -> Result<UploadOutcome> {
        let finalization = |err: UploadError| UploadError::Finalization(err.to_string());
        let asset_path = self.asset_path(job);
        let asset_type = AssetType::from_mime(&job.file.mime_type);

        self.metadata
            .update_upload_session(session_id, SessionStatus::Completed)
            .await
            .map_err(finalization)?;

        self.storage
            .put_object(
                &self.config.bucket,
                &asset_path,
                Bytes::clone(&job.file.data),
                PutOptions::overwrite(job.file.mime_type.clone()),
            )
            .await
            .map_err(finalization)?;

        self.metadata
            .insert_media_asset(NewMediaAsset {
                owner_id: self.config.owner_id.clone(),
                draft_id: job.draft_id.clone(),
                path: asset_path.clone(),
                asset_type,
                file_size: job.file.size(),
                mime_type: job.file.mime_type.clone(),
                original_filename: job.file.name.clone(),
                status: "ready".to_string(),
            })
            .await
            .map_err(finalization)?;

        let public_url = self.storage.public_url(&self.config.bucket, &asset_path);

        self.metadata
            .insert_history_event(NewHistoryEvent {
                draft_id: job.draft_id.clone(),
                owner_id: self.config.owner_id.clone(),
                event_type: HISTORY_EVENT_MEDIA_UPLOADED.to_string(),
                event_data: json!({
                    "upload_id": job.upload_id,
                    "session_id": session_id,
                    "file_name": job.file.name,
                    "file_size": job.file.size(),
                    "mime_type": job.file.mime_type,
                    "asset_type": asset_type,
                    "path": asset_path,
                    "url": public_url,
                    "total_chunks": total_chunks,
                }),
            })
            .await
            .map_err(finalization)?;

        info!(upload_id = %job.upload_id, session_id = %session_id, path = %asset_path, "upload finalized");

        Ok(UploadOutcome::Completed {
            asset_path,
            public_url,
        })
    }
}

/// Keep object keys to a single path segment
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect();

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
