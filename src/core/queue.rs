use super::errors::{Result, UploadError};
use super::item::UploadItem;
use super::types::{UploadFile, UploadId, UploadStatus};

pub(crate) struct QueueEntry {
    pub item: UploadItem,
    /// Gone once completed, never present on restored items
    pub file: Option<UploadFile>,
    seq: u64,
}

/// Backlog kept sorted by descending priority, ties in insertion order
#[derive(Default)]
pub(crate) struct UploadQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: UploadItem, file: Option<UploadFile>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry { item, file, seq });
        self.sort();
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.item.priority
                .cmp(&a.item.priority)
                .then(a.seq.cmp(&b.seq))
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: UploadId) -> Option<&QueueEntry> {
        self.entries.iter().find(|entry| entry.item.id == id)
    }

    pub fn get_mut(&mut self, id: UploadId) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|entry| entry.item.id == id)
    }

    pub fn entry_mut(&mut self, id: UploadId) -> Result<&mut QueueEntry> {
        self.get_mut(id).ok_or(UploadError::NotFound(id))
    }

    pub fn remove(&mut self, id: UploadId) -> Option<QueueEntry> {
        let position = self.entries.iter().position(|entry| entry.item.id == id)?;
        Some(self.entries.remove(position))
    }

    /// Drop completed items, returning how many went
    pub fn remove_completed(&mut self) -> Vec<UploadId> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if entry.item.status == UploadStatus::Completed {
                removed.push(entry.item.id);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn set_priority(&mut self, id: UploadId, priority: i32) -> Result<()> {
        self.entry_mut(id)?.item.priority = priority;
        self.sort();
        Ok(())
    }

    /// First queued item in priority order
    pub fn next_queued(&self) -> Option<UploadId> {
        self.entries
            .iter()
            .find(|entry| entry.item.status == UploadStatus::Queued && entry.file.is_some())
            .map(|entry| entry.item.id)
    }

    pub fn items(&self) -> impl Iterator<Item = &UploadItem> {
        self.entries.iter().map(|entry| &entry.item)
    }
}
