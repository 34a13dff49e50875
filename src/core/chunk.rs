use std::ops::Range;
use bytes::Bytes;

/// Byte range of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u32,
    pub offset: u64,
    pub size: usize,
}

impl ChunkInfo {
    pub fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.size
    }

    /// Zero-copy view of this chunk inside `data`
    pub fn slice(&self, data: &Bytes) -> Bytes {
        data.slice(self.range())
    }
}

/// `ceil(file_size / chunk_size)`. An empty file still counts as one chunk.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    file_size.div_ceil(chunk_size).max(1) as u32
}

/// Split a file of `file_size` bytes into ordered fixed-size ranges.
pub fn calculate_chunks(file_size: u64, chunk_size: usize) -> Vec<ChunkInfo> {
    let chunk_size = chunk_size.max(1) as u64;
    let mut chunks = Vec::with_capacity(total_chunks(file_size, chunk_size as usize) as usize);
    let mut offset = 0;
    let mut index = 0;

    while offset < file_size {
        let size = std::cmp::min(chunk_size, file_size - offset) as usize;
        chunks.push(ChunkInfo {
            index,
            offset,
            size,
        });
        offset += size as u64;
        index += 1;
    }

    if chunks.is_empty() {
        chunks.push(ChunkInfo {
            index: 0,
            offset: 0,
            size: 0,
        });
    }

    chunks
}

/// Percent after `acknowledged` of `total` chunks, rounded half up
pub fn chunk_progress(acknowledged: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let acknowledged = acknowledged.min(total) as u64;
    ((acknowledged * 200 + total as u64) / (2 * total as u64)) as u8
}
