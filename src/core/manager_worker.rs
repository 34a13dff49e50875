use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use super::errors::{Result, UploadError};
use super::item::UploadItem;
use super::persistence::PersistenceBridge;
use super::queue::UploadQueue;
use super::session::{SessionCoordinator, TaskEvent, UploadControl, UploadJob, UploadOutcome};
use super::types::{ManagerCommand, QueueConfig, UploadEvent, UploadFile, UploadId, UploadStatus};

/// The single upload currently owned by a spawned task
struct ActiveUpload {
    upload_id: UploadId,
    cancellation_token: CancellationToken,
    status_tx: watch::Sender<UploadStatus>,
    join_handle: JoinHandle<Result<UploadOutcome>>,
}

pub(crate) struct UploadManagerWorker {
    config: Arc<QueueConfig>,
    coordinator: SessionCoordinator,
    persistence: PersistenceBridge,
    queue: UploadQueue,
    active: Option<ActiveUpload>,
    dirty: bool,

    event_tx: broadcast::Sender<UploadEvent>,
    task_event_tx: mpsc::UnboundedSender<TaskEvent>,
    task_event_rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl UploadManagerWorker {
    pub(crate) async fn run(
        config: Arc<QueueConfig>,
        coordinator: SessionCoordinator,
        persistence: PersistenceBridge,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (task_event_tx, task_event_rx) = mpsc::unbounded_channel();
        let mut worker = Self {
            config,
            coordinator,
            persistence,
            queue: UploadQueue::new(),
            active: None,
            dirty: false,
            event_tx,
            task_event_tx,
            task_event_rx,
        };

        worker.restore_state().await;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        worker.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => worker.handle_command(command),
                    None => {
                        worker.shutdown().await;
                        break;
                    }
                },
                Some(event) = worker.task_event_rx.recv() => {
                    worker.handle_task_event(event).await;
                }
            }

            worker.process_queue();
            worker.save_state().await;
        }

        debug!("upload manager worker stopped");
    }

    /// Start the highest-priority queued item when nothing is in flight
    fn process_queue(&mut self) {
        if self.active.is_some() {
            return;
        }

        if let Some(upload_id) = self.queue.next_queued() {
            if let Err(err) = self.start_upload(upload_id) {
                error!(upload_id = %upload_id, error = %err, "failed to start upload");
            }
        }
    }

    fn start_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let entry = self.queue.entry_mut(upload_id)?;
        let file = entry.file.clone().ok_or(UploadError::PayloadUnavailable(upload_id))?;
        let old_status = entry.item.start()?;

        let job = UploadJob {
            upload_id,
            draft_id: entry.item.draft_id.clone(),
            file,
            session_id: entry.item.session_id.clone(),
            start_chunk: entry.item.chunks_acknowledged,
        };

        let cancellation_token = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(UploadStatus::Uploading);
        let control = UploadControl {
            token: cancellation_token.clone(),
            status: status_rx,
        };

        let coordinator = self.coordinator.clone();
        let task_event_tx = self.task_event_tx.clone();
        let join_handle = tokio::spawn(async move {
            let result = coordinator.run(job, control, task_event_tx.clone()).await;

            // report completion
            let _ = task_event_tx.send(TaskEvent::Finished { upload_id });

            result
        });

        self.active = Some(ActiveUpload {
            upload_id,
            cancellation_token,
            status_tx,
            join_handle,
        });

        info!(upload_id = %upload_id, "upload started");
        self.dirty = true;
        self.emit_state_change(upload_id, old_status, UploadStatus::Uploading);
        Ok(())
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Enqueue { file, draft_id, priority, thumbnail, reply } => {
                let upload_id = self.enqueue(file, draft_id, priority, thumbnail);
                let _ = reply.send(upload_id);
            }
            ManagerCommand::Reprioritize { upload_id, priority, reply } => {
                let result = self.queue.set_priority(upload_id, priority);
                if result.is_ok() {
                    self.dirty = true;
                }
                let _ = reply.send(result);
            }
            ManagerCommand::Pause { upload_id, reply } => {
                let _ = reply.send(self.pause_upload(upload_id));
            }
            ManagerCommand::Resume { upload_id, reply } => {
                let _ = reply.send(self.resume_upload(upload_id));
            }
            ManagerCommand::Retry { upload_id, reply } => {
                let _ = reply.send(self.retry_upload(upload_id));
            }
            ManagerCommand::Remove { upload_id, reply } => {
                let _ = reply.send(self.remove_upload(upload_id));
            }
            ManagerCommand::GetItem { upload_id, reply } => {
                let item = self.queue.get(upload_id).map(|entry| entry.item.clone());
                let _ = reply.send(item);
            }
            ManagerCommand::GetAllItems { reply } => {
                let _ = reply.send(self.queue.items().cloned().collect());
            }
            ManagerCommand::ClearFinished { reply } => {
                let removed = self.queue.remove_completed();
                for upload_id in &removed {
                    let _ = self.event_tx.send(UploadEvent::Removed { upload_id: *upload_id });
                }
                self.dirty |= !removed.is_empty();
                let _ = reply.send(removed.len());
            }
            ManagerCommand::Shutdown { reply } => {
                // handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, file: UploadFile, draft_id: String, priority: Option<i32>, thumbnail: Option<String>) -> UploadId {
        let priority = priority.unwrap_or(self.config.default_priority);
        let item = UploadItem::new(&file, draft_id, priority).with_thumbnail(thumbnail);
        let upload_id = item.id;

        info!(upload_id = %upload_id, file = %item.file_name, size = item.file_size, priority, "upload enqueued");
        self.queue.push(item, Some(file));
        self.dirty = true;
        let _ = self.event_tx.send(UploadEvent::Enqueued { upload_id });

        upload_id
    }

    fn pause_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let entry = self.queue.entry_mut(upload_id)?;
        let old_status = entry.item.pause()?;

        if old_status == UploadStatus::Uploading {
            // the task stops at the next chunk boundary
            if let Some(active) = self.active.as_ref().filter(|active| active.upload_id == upload_id) {
                active.status_tx.send_replace(UploadStatus::Paused);
                active.cancellation_token.cancel();
            }
        }

        info!(upload_id = %upload_id, progress = entry.item.progress, "upload paused");
        self.dirty = true;
        self.emit_state_change(upload_id, old_status, UploadStatus::Paused);
        Ok(())
    }

    fn resume_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let entry = self.queue.entry_mut(upload_id)?;
        if entry.file.is_none() {
            return Err(UploadError::PayloadUnavailable(upload_id));
        }
        let old_status = entry.item.resume()?;

        info!(upload_id = %upload_id, from_chunk = entry.item.chunks_acknowledged, "upload resumed");
        self.dirty = true;
        self.emit_state_change(upload_id, old_status, UploadStatus::Queued);
        Ok(())
    }

    fn retry_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let entry = self.queue.entry_mut(upload_id)?;
        if entry.file.is_none() {
            return Err(UploadError::PayloadUnavailable(upload_id));
        }
        let old_status = entry.item.reset_for_retry()?;

        info!(upload_id = %upload_id, "upload retried");
        self.dirty = true;
        self.emit_state_change(upload_id, old_status, UploadStatus::Queued);
        let _ = self.event_tx.send(UploadEvent::Progress { upload_id, progress: 0 });
        Ok(())
    }

    fn remove_upload(&mut self, upload_id: UploadId) -> Result<()> {
        self.queue.remove(upload_id).ok_or(UploadError::NotFound(upload_id))?;

        if let Some(active) = self.active.as_ref().filter(|active| active.upload_id == upload_id) {
            active.cancellation_token.cancel();
        }

        info!(upload_id = %upload_id, "upload removed");
        self.dirty = true;
        let _ = self.event_tx.send(UploadEvent::Removed { upload_id });
        Ok(())
    }

    async fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::SessionCreated { upload_id, session_id, total_chunks } => {
                if let Some(entry) = self.queue.get_mut(upload_id) {
                    entry.item.session_id = Some(session_id);
                    entry.item.total_chunks = Some(total_chunks);
                    entry.item.chunks_acknowledged = 0;
                    self.dirty = true;
                }
            }
            TaskEvent::ChunkAcknowledged { upload_id, index, progress } => {
                if let Some(entry) = self.queue.get_mut(upload_id) {
                    entry.item.chunks_acknowledged = index + 1;
                    self.dirty = true;
                    if entry.item.set_progress(progress) {
                        let progress = entry.item.progress;
                        let _ = self.event_tx.send(UploadEvent::Progress { upload_id, progress });
                    }
                }
            }
            TaskEvent::Finalizing { upload_id } => {
                let Some(entry) = self.queue.get_mut(upload_id) else {
                    return;
                };
                // a pause that lands after the last chunk does not stop finalization
                if let Ok(old_status) = entry.item.transition(UploadStatus::Processing, "finalize") {
                    self.dirty = true;
                    self.emit_state_change(upload_id, old_status, UploadStatus::Processing);
                }
            }
            TaskEvent::Finished { upload_id } => {
                self.handle_task_completion(upload_id).await;
            }
        }
    }

    async fn handle_task_completion(&mut self, upload_id: UploadId) {
        let active = match self.active.take() {
            Some(active) if active.upload_id == upload_id => active,
            other => {
                self.active = other;
                warn!(upload_id = %upload_id, "completion for an upload that is not in flight");
                return;
            }
        };

        let result = active.join_handle.await;

        let Some(entry) = self.queue.get_mut(upload_id) else {
            debug!(upload_id = %upload_id, "removed upload stopped");
            return;
        };
        self.dirty = true;

        match result {
            Ok(Ok(UploadOutcome::Completed { asset_path, public_url })) => {
                let progressed = entry.item.progress < 100;
                let old_status = entry.item.complete(asset_path.clone());
                entry.file = None;

                info!(upload_id = %upload_id, path = %asset_path, "upload completed");
                if progressed {
                    let _ = self.event_tx.send(UploadEvent::Progress { upload_id, progress: 100 });
                }
                self.emit_state_change(upload_id, old_status, UploadStatus::Completed);
                let _ = self.event_tx.send(UploadEvent::Completed {
                    upload_id,
                    asset_path,
                    public_url,
                });
            }
            Ok(Ok(UploadOutcome::Paused)) => {
                debug!(upload_id = %upload_id, chunks = entry.item.chunks_acknowledged, "upload stopped at chunk boundary");
            }
            Ok(Err(err)) if err.is_cancelled() && !entry.item.status.is_active() => {
                debug!(upload_id = %upload_id, status = %entry.item.status, "cancelled upload left as is");
            }
            Ok(Err(err)) => {
                let error = err.to_string();
                let old_status = entry.item.fail(error.clone());

                warn!(upload_id = %upload_id, error = %error, "upload failed");
                self.emit_state_change(upload_id, old_status, UploadStatus::Failed);
                let _ = self.event_tx.send(UploadEvent::Failed { upload_id, error });
            }
            Err(err) => {
                let error = format!("Task panicked: {}", err);
                let old_status = entry.item.fail(error.clone());

                error!(upload_id = %upload_id, error = %error, "upload task panicked");
                self.emit_state_change(upload_id, old_status, UploadStatus::Failed);
                let _ = self.event_tx.send(UploadEvent::Failed { upload_id, error });
            }
        }
    }

    fn emit_state_change(&self, upload_id: UploadId, old_status: UploadStatus, new_status: UploadStatus) {
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            upload_id,
            old_status,
            new_status,
        });
    }

    /// Stop the in-flight upload at its chunk boundary. Its item stays as
    /// it is in the snapshot; the next start reconciles it.
    async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            active.status_tx.send_replace(UploadStatus::Paused);
            active.cancellation_token.cancel();
            if let Err(err) = active.join_handle.await {
                warn!(upload_id = %active.upload_id, error = %err, "upload task did not stop cleanly");
            }
        }

        // fold in what the stopped task reported before it returned
        while let Ok(event) = self.task_event_rx.try_recv() {
            if !matches!(event, TaskEvent::Finished { .. }) {
                self.handle_task_event(event).await;
            }
        }

        self.save_state().await;
        info!(items = self.queue.len(), "upload manager shut down");
    }

    /// Save queue metadata after every change
    async fn save_state(&mut self) {
        if !self.dirty {
            return;
        }

        match self.persistence.save(self.queue.items()).await {
            Ok(()) => self.dirty = false,
            Err(err) => warn!(error = %err, "failed to save queue state"),
        }
    }

    /// Restored items carry no payload and are already reconciled
    async fn restore_state(&mut self) {
        let items = self.persistence.load().await;
        if items.is_empty() {
            return;
        }

        for item in items {
            self.queue.push(item, None);
        }
        self.dirty = true;
        self.save_state().await;
    }
}
