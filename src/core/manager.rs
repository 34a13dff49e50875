use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use super::errors::{Result, UploadError};
use super::item::UploadItem;
use super::manager_worker::UploadManagerWorker;
use super::persistence::PersistenceBridge;
use super::session::SessionCoordinator;
use super::traits::{MetadataStore, ObjectStorage, StateStore};
use super::types::{ManagerCommand, QueueConfig, UploadEvent, UploadFile, UploadId};
use crate::thumbnail::ThumbnailGenerator;

/// Front door of the upload queue. Cheap to clone; every clone talks to the
/// same worker.
#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    thumbnails: ThumbnailGenerator,
}

/// Manager plus the worker task driving it
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    /// Stop the worker and wait for the final snapshot
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.manager.command_tx.send(ManagerCommand::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }

        drop(self.manager);
        self.worker_handle.await
            .map_err(|err| UploadError::internal(format!("Worker panic: {}", err)))
    }
}

pub struct UploadManagerBuilder {
    config: QueueConfig,
    storage: Option<Arc<dyn ObjectStorage>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    state_store: Option<Arc<dyn StateStore>>,
    thumbnails: ThumbnailGenerator,
}

impl UploadManagerBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            storage: None,
            metadata: None,
            state_store: None,
            thumbnails: ThumbnailGenerator::disabled(),
        }
    }

    pub fn storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    pub fn thumbnails(mut self, thumbnails: ThumbnailGenerator) -> Self {
        self.thumbnails = thumbnails;
        self
    }

    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<UploadManagerHandle> {
        let storage = self.storage
            .ok_or_else(|| UploadError::internal("Object storage is not configured"))?;
        let metadata = self.metadata
            .ok_or_else(|| UploadError::internal("Metadata store is not configured"))?;
        let state_store = self.state_store
            .ok_or_else(|| UploadError::internal("State store is not configured"))?;
        if self.config.chunk_size == 0 {
            return Err(UploadError::internal("Chunk size must be greater than zero"));
        }

        let config = Arc::new(self.config);
        let coordinator = SessionCoordinator::new(storage, metadata, config.clone());
        let persistence = PersistenceBridge::new(state_store, config.state_key.clone());

        Ok(UploadManager::spawn(config, coordinator, persistence, self.thumbnails))
    }
}

impl UploadManager {
    pub fn builder(config: QueueConfig) -> UploadManagerBuilder {
        UploadManagerBuilder::new(config)
    }

    fn spawn(
        config: Arc<QueueConfig>,
        coordinator: SessionCoordinator,
        persistence: PersistenceBridge,
        thumbnails: ThumbnailGenerator,
    ) -> UploadManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // at most 256 buffered events
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(UploadManagerWorker::run(
            config,
            coordinator,
            persistence,
            command_rx,
            event_tx.clone(),
        ));

        let manager = Self {
            command_tx,
            event_tx,
            thumbnails,
        };

        UploadManagerHandle {
            manager,
            worker_handle,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::ManagerShutdown)?;

        reply_rx
            .await
            .map_err(|_| UploadError::ManagerShutdown)
    }

    /// Add a file with the configured default priority
    pub async fn enqueue(&self, file: UploadFile, draft_id: impl Into<String>) -> Result<UploadId> {
        self.enqueue_inner(file, draft_id.into(), None).await
    }

    /// Add a file; higher priorities start first
    pub async fn enqueue_with_priority(
        &self,
        file: UploadFile,
        draft_id: impl Into<String>,
        priority: i32,
    ) -> Result<UploadId> {
        self.enqueue_inner(file, draft_id.into(), Some(priority)).await
    }

    async fn enqueue_inner(&self, file: UploadFile, draft_id: String, priority: Option<i32>) -> Result<UploadId> {
        // the preview exists before the item is visible
        let thumbnail = self.thumbnails.generate(&file).await;

        self.request(|reply| ManagerCommand::Enqueue {
            file,
            draft_id,
            priority,
            thumbnail,
            reply,
        })
        .await
    }

    pub async fn reprioritize(&self, upload_id: UploadId, priority: i32) -> Result<()> {
        self.request(|reply| ManagerCommand::Reprioritize { upload_id, priority, reply }).await?
    }

    /// Pause a queued item, or stop the uploading one at its next chunk
    /// boundary. The session is kept.
    ///
    /// Only `queued` and `uploading` items can be paused; any other status,
    /// `processing` included, returns [`UploadError::InvalidState`] and the
    /// item is left as it was.
    pub async fn pause(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Pause { upload_id, reply }).await?
    }

    /// Requeue a paused item; it continues after its last acknowledged chunk.
    /// Failed items go through [`retry`](Self::retry) instead.
    pub async fn resume(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Resume { upload_id, reply }).await?
    }

    /// Requeue a failed item; it starts over with a new session
    pub async fn retry(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Retry { upload_id, reply }).await?
    }

    pub async fn remove(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| ManagerCommand::Remove { upload_id, reply }).await?
    }

    pub async fn get(&self, upload_id: UploadId) -> Result<Option<UploadItem>> {
        self.request(|reply| ManagerCommand::GetItem { upload_id, reply }).await
    }

    /// Every item in queue order
    pub async fn items(&self) -> Result<Vec<UploadItem>> {
        self.request(|reply| ManagerCommand::GetAllItems { reply }).await
    }

    /// Drop completed items, returning how many were removed
    pub async fn clear_finished(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearFinished { reply }).await
    }

    /// Subscribe to queue events
    ///
    /// Slow receivers may miss events (lagged error); every subscriber sees
    /// its own copy.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F> {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }
}

/// Event receiver that skips events the filter rejects
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
