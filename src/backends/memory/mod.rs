//! In-process storage and metadata backend.
//!
//! Keeps every object and record in memory. Used by the test-suite and by
//! the CLI's `--dry-run` mode; supports one-shot failure injection and a gate
//! that holds object writes until it is opened.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;
use crate::core::{
    MetadataStore,
    NewHistoryEvent,
    NewMediaAsset,
    NewUploadChunk,
    NewUploadSession,
    ObjectStorage,
    PutOptions,
    Result,
    SessionStatus,
    UploadError,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub id: String,
    pub request: NewUploadSession,
    pub status: SessionStatus,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), Bytes>,
    sessions: Vec<StoredSession>,
    /// session id -> chunk index -> record
    chunks: HashMap<String, BTreeMap<u32, NewUploadChunk>>,
    assets: Vec<NewMediaAsset>,
    history: Vec<NewHistoryEvent>,
    put_count: usize,

    fail_session: Option<String>,
    fail_chunks: HashMap<u32, String>,
    fail_asset: Option<String>,
    put_delay: Option<Duration>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    gate: Arc<watch::Sender<bool>>,
    blocked: Arc<watch::Sender<usize>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (blocked, _) = watch::channel(0);

        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            gate: Arc::new(gate),
            blocked: Arc::new(blocked),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delay every object write
    pub fn with_put_delay(self, delay: Duration) -> Self {
        self.lock().put_delay = Some(delay);
        self
    }

    /// The next session creation fails with `message`
    pub fn fail_session_creation(&self, message: impl Into<String>) {
        self.lock().fail_session = Some(message.into());
    }

    /// The next write of chunk `index` (any session) fails with `message`
    pub fn fail_chunk(&self, index: u32, message: impl Into<String>) {
        self.lock().fail_chunks.insert(index, message.into());
    }

    /// The next media asset registration fails with `message`
    pub fn fail_media_asset(&self, message: impl Into<String>) {
        self.lock().fail_asset = Some(message.into());
    }

    /// Hold object writes until [`open_gate`](Self::open_gate)
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until at least one write is held by the closed gate
    pub async fn wait_for_blocked_put(&self) {
        let mut rx = self.blocked.subscribe();
        let _ = rx.wait_for(|blocked| *blocked > 0).await;
    }

    pub fn sessions(&self) -> Vec<StoredSession> {
        self.lock().sessions.clone()
    }

    /// Distinct chunk records of a session
    pub fn chunk_count(&self, session_id: &str) -> usize {
        self.lock().chunks.get(session_id).map_or(0, |chunks| chunks.len())
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    /// Number of object writes attempted
    pub fn put_count(&self) -> usize {
        self.lock().put_count
    }

    pub fn assets(&self) -> Vec<NewMediaAsset> {
        self.lock().assets.clone()
    }

    pub fn history(&self) -> Vec<NewHistoryEvent> {
        self.lock().history.clone()
    }

    async fn wait_gate(&self) {
        if *self.gate.borrow() {
            return;
        }

        let mut rx = self.gate.subscribe();
        self.blocked.send_modify(|blocked| *blocked += 1);
        let _ = rx.wait_for(|open| *open).await;
        self.blocked.send_modify(|blocked| *blocked -= 1);
    }
}

fn chunk_index(path: &str) -> Option<u32> {
    path.rsplit('/')
        .next()
        .and_then(|name| name.strip_prefix("chunk_"))
        .and_then(|index| index.parse().ok())
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
    async fn put_object(&self, bucket: &str, path: &str, data: Bytes, options: PutOptions) -> Result<()> {
        let delay = {
            let mut inner = self.lock();
            inner.put_count += 1;
            inner.put_delay
        };

        self.wait_gate().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if let Some(index) = chunk_index(path) {
            if let Some(message) = inner.fail_chunks.remove(&index) {
                return Err(UploadError::storage(message));
            }
        }

        let key = (bucket.to_string(), path.to_string());
        if !options.overwrite && inner.objects.contains_key(&key) {
            return Err(UploadError::storage(format!("The resource already exists: {path}")));
        }

        debug!(bucket, path, size = data.len(), "memory object stored");
        inner.objects.insert(key, data);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{bucket}/{path}")
    }
}

#[async_trait]
impl MetadataStore for MemoryBackend {
    async fn create_upload_session(&self, session: NewUploadSession) -> Result<String> {
        let mut inner = self.lock();
        if let Some(message) = inner.fail_session.take() {
            return Err(UploadError::metadata(message));
        }

        let id = Uuid::new_v4().to_string();
        inner.sessions.push(StoredSession {
            id: id.clone(),
            request: session,
            status: SessionStatus::Uploading,
        });
        Ok(id)
    }

    async fn update_upload_session(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = status;
        }
        Ok(())
    }

    async fn insert_upload_chunk(&self, chunk: NewUploadChunk) -> Result<()> {
        self.lock()
            .chunks
            .entry(chunk.session_id.clone())
            .or_default()
            .insert(chunk.chunk_index, chunk);
        Ok(())
    }

    async fn insert_media_asset(&self, asset: NewMediaAsset) -> Result<()> {
        let mut inner = self.lock();
        if let Some(message) = inner.fail_asset.take() {
            return Err(UploadError::metadata(message));
        }
        inner.assets.push(asset);
        Ok(())
    }

    async fn insert_history_event(&self, event: NewHistoryEvent) -> Result<()> {
        self.lock().history.push(event);
        Ok(())
    }
}
