//! Chunk arithmetic
//!
//! A content item of `size` bytes is split into `ceil(size / chunk_size)`
//! fixed-size chunks; only the last one may be short.

use crate::protocol::constants::CHUNK_SIZE;

/// Chunk layout of a single content item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Total content size in bytes
    pub size: u64,
    /// Nominal chunk size in bytes
    pub chunk_size: u64,
}

impl ChunkLayout {
    /// Layout with the protocol chunk size
    pub fn new(size: u64) -> Self {
        Self::with_chunk_size(size, CHUNK_SIZE)
    }

    /// Layout with a custom chunk size (must be non-zero)
    pub fn with_chunk_size(size: u64, chunk_size: u64) -> Self {
        Self {
            size,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of chunks
    pub fn count(&self) -> u32 {
        chunk_count(self.size, self.chunk_size)
    }

    /// Byte offset of a chunk
    pub fn offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size
    }

    /// Length of a chunk, or `None` when the index is out of range
    pub fn len_of(&self, index: u32) -> Option<u64> {
        if index >= self.count() {
            return None;
        }
        let start = self.offset(index);
        Some(self.chunk_size.min(self.size - start))
    }
}

/// `ceil(size / chunk_size)`
pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    ((size + chunk_size - 1) / chunk_size) as u32
}
