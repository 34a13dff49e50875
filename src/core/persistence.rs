use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use super::errors::Result;
use super::item::UploadItem;
use super::traits::StateStore;
use super::types::UploadStatus;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Error given to every restored item that was not completed
pub const SESSION_INTERRUPTED: &str = "Session interrupted";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub items: Vec<UploadItem>,
}

/// Writes queue metadata to durable storage and reads it back once at start
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn StateStore>,
    key: String,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn encode(items: &[UploadItem]) -> Result<String> {
        let snapshot = QueueSnapshot {
            version: SNAPSHOT_VERSION,
            items: items.to_vec(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    pub async fn save<'a>(&self, items: impl IntoIterator<Item = &'a UploadItem>) -> Result<()> {
        let items: Vec<UploadItem> = items.into_iter().cloned().collect();
        let data = Self::encode(&items)?;
        self.store.save(&self.key, data).await
    }

    /// Restored items, reconciled. A missing or unreadable snapshot gives an
    /// empty queue.
    pub async fn load(&self) -> Vec<UploadItem> {
        let data = match self.store.load(&self.key).await {
            Ok(Some(data)) => data,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(key = %self.key, error = %err, "failed to read queue state");
                return Vec::new();
            }
        };

        let snapshot: QueueSnapshot = match serde_json::from_str(&data) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(key = %self.key, error = %err, "discarding unreadable queue state");
                return Vec::new();
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(key = %self.key, version = snapshot.version, "discarding queue state with unknown version");
            return Vec::new();
        }

        let items = reconcile(snapshot.items);
        info!(key = %self.key, restored = items.len(), "queue state restored");
        items
    }
}

/// Without the file payload nothing but a completed item can be trusted
pub fn reconcile(items: Vec<UploadItem>) -> Vec<UploadItem> {
    items
        .into_iter()
        .map(|mut item| {
            if item.status != UploadStatus::Completed {
                item.status = UploadStatus::Failed;
                item.error = Some(SESSION_INTERRUPTED.to_string());
            }
            item
        })
        .collect()
}
